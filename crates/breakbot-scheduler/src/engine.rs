//! Engine runner: the timer loop shared by every background engine.
//! Uses `tokio::time::interval_at` so the first tick fires one full period after start.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A periodic unit of background work.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// One pass over the registry. Failures are handled inside; a tick never fails.
    async fn tick(&self);

    /// Wait for follow-up work a tick left running in the background.
    async fn settle(&self) {}
}

/// Handle to a running engine timer.
///
/// Dropping the handle stops the timer as well.
pub struct EngineHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop scheduling future ticks. A tick already in flight runs to completion.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            tracing::info!("🛑 {} stopped", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some() && !self.task.is_finished()
    }

    /// Stop and wait for the timer task to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        let name = self.name;
        if let Err(e) = self.task.await {
            tracing::warn!("⚠️ {} timer task ended abnormally: {e}", name);
        }
    }
}

/// Spawn the timer loop for `engine`, ticking every `period`.
///
/// Each tick is spawned as its own task: ticks may overlap when one outlives
/// the period, and stopping the timer does not cancel them.
pub fn spawn_engine<E: Engine + ?Sized>(engine: Arc<E>, period: Duration) -> EngineHandle {
    let name = engine.name();
    tracing::debug!("⏰ {} starting (tick every {}s)", name, period.as_secs());

    let (tx, mut rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut rx => break,
                _ = interval.tick() => {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move { engine.tick().await });
                }
            }
        }
    });

    EngineHandle {
        name,
        shutdown: Some(tx),
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        ticks: AtomicUsize,
        finished: AtomicUsize,
        work: Duration,
    }

    #[async_trait]
    impl Engine for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter(work: Duration) -> Arc<Counter> {
        Arc::new(Counter {
            ticks: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            work,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_period() {
        let engine = counter(Duration::ZERO);
        let mut handle = spawn_engine(Arc::clone(&engine), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(engine.ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(22)).await;
        assert_eq!(engine.ticks.load(Ordering::SeqCst), 3);
        handle.stop();
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_tick_finish() {
        let engine = counter(Duration::from_secs(30));
        let mut handle = spawn_engine(Arc::clone(&engine), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(engine.ticks.load(Ordering::SeqCst), 1);

        handle.stop();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(engine.ticks.load(Ordering::SeqCst), 1);
        assert_eq!(engine.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ticks_overlap() {
        let engine = counter(Duration::from_secs(25));
        let handle = spawn_engine(Arc::clone(&engine), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(engine.ticks.load(Ordering::SeqCst), 3);
        assert_eq!(engine.finished.load(Ordering::SeqCst), 0);
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.finished.load(Ordering::SeqCst), 3);
    }
}
