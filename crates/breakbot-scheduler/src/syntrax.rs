//! Syntrax: keeps the issue tracker in step with incident log activity.
//!
//! Each tick:
//! 1. take `now`, query log entries created after the watermark (or after the
//!    oldest retry marker, whichever is earlier), grouped by incident
//! 2. advance the watermark to `now` before any sync call is made
//! 3. skip incidents that are no longer live (logged as an inconsistency)
//! 4. for every other incident spawn a sync call after a random delay
//! 5. await every call independently; a failed incident keeps a retry marker so
//!    its entries are re-sent next tick even if nothing new is logged
//! 6. store the issue key the tracker reports for incidents that had none

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use breakbot_core::error::{BreakbotError, Result};
use breakbot_core::registry::SharedRegistry;
use breakbot_core::traits::IssueTracker;
use breakbot_core::types::LogEntry;
use breakbot_db::IncidentStore;
use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;

use crate::engine::Engine;

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub missing: usize,
}

struct SyncState {
    watermark: DateTime<Utc>,
    /// Incident id → marker of the last attempt that failed.
    retry: HashMap<i64, DateTime<Utc>>,
}

/// One dispatched sync call.
struct Dispatch {
    id: i64,
    marker: DateTime<Utc>,
    had_key: bool,
}

/// The tracker-sync engine.
pub struct Syntrax {
    registry: SharedRegistry,
    store: Arc<IncidentStore>,
    tracker: Arc<dyn IssueTracker>,
    max_jitter: Duration,
    state: Mutex<SyncState>,
}

impl Syntrax {
    /// Build the engine. Without a tracker there is nothing to sync to, which is a wiring error.
    pub fn new(
        registry: SharedRegistry,
        store: Arc<IncidentStore>,
        tracker: Option<Arc<dyn IssueTracker>>,
        max_jitter: Duration,
    ) -> Result<Self> {
        let tracker = tracker.ok_or_else(|| {
            BreakbotError::Config("tracker sync requires a configured issue tracker".into())
        })?;
        Ok(Self {
            registry,
            store,
            tracker,
            max_jitter,
            state: Mutex::new(SyncState {
                watermark: Utc::now(),
                retry: HashMap::new(),
            }),
        })
    }

    /// Start from `at` instead of construction time, so the first tick
    /// picks up activity logged since then.
    pub fn with_watermark(mut self, at: DateTime<Utc>) -> Self {
        self.state
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .watermark = at;
        self
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.lock_state().watermark
    }

    /// Incidents whose last sync failed and will be retried.
    pub fn pending_retries(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock_state().retry.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        // The state is only touched in short synchronous sections; a poisoned
        // lock still holds a usable watermark.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Run one sync pass.
    pub async fn run_tick(&self) -> SyncReport {
        tracing::debug!("🔄 Syntrax tick started");
        let mut report = SyncReport::default();

        // Stored timestamps carry microseconds; step back one so an entry
        // written in the same microsecond is sent again rather than lost.
        let now = Utc::now().trunc_subsecs(6) - chrono::Duration::microseconds(1);
        let (watermark, retry) = {
            let state = self.lock_state();
            (state.watermark, state.retry.clone())
        };
        let floor = retry.values().copied().fold(watermark, DateTime::min);

        let grouped = match self.store.logs_since(floor) {
            Ok(grouped) => {
                self.lock_state().watermark = now;
                grouped
            }
            Err(e) => {
                tracing::warn!("⚠️ Syntrax could not read new log entries: {e}");
                Default::default()
            }
        };

        let mut work = Vec::new();
        {
            let registry = self.registry.lock().await;
            for (id, entries) in grouped {
                let marker = retry.get(&id).copied().unwrap_or(watermark);
                let entries: Vec<LogEntry> = entries
                    .into_iter()
                    .filter(|e| e.created_at > marker)
                    .collect();
                if entries.is_empty() {
                    continue;
                }
                match registry.find_by_id(id) {
                    Some(machine) => work.push((id, marker, machine.clone(), entries)),
                    None => {
                        tracing::error!(
                            "❌ Incident #{} has new log entries but is not live; skipping sync",
                            id
                        );
                        self.lock_state().retry.remove(&id);
                        report.missing += 1;
                    }
                }
            }
        }

        tracing::debug!("📤 Syncing {} incidents", work.len());

        let mut dispatched = Vec::with_capacity(work.len());
        let mut handles = Vec::with_capacity(work.len());
        for (id, marker, machine, entries) in work {
            let tracker = Arc::clone(&self.tracker);
            let delay = self.jitter();
            dispatched.push(Dispatch {
                id,
                marker,
                had_key: machine.data().tracker_key.is_some(),
            });
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                tracker
                    .sync(machine.data(), machine.state(), &entries)
                    .await
            }));
        }
        report.dispatched = dispatched.len();
        let results = futures::future::join_all(handles).await;

        let mut new_keys = Vec::new();
        {
            let mut state = self.lock_state();
            for (call, result) in dispatched.into_iter().zip(results) {
                let outcome = result.unwrap_or_else(|e| {
                    Err(BreakbotError::Tracker(format!("sync task aborted: {e}")))
                });
                match outcome {
                    Ok(key) => {
                        state.retry.remove(&call.id);
                        report.succeeded += 1;
                        if let (false, Some(key)) = (call.had_key, key) {
                            new_keys.push((call.id, key));
                        }
                    }
                    Err(e) => {
                        tracing::warn!("⚠️ Tracker sync failed for incident #{}: {}", call.id, e);
                        state.retry.entry(call.id).or_insert(call.marker);
                        report.failed += 1;
                    }
                }
            }
        }

        for (id, key) in new_keys {
            self.remember_key(id, &key).await;
        }

        tracing::debug!("✅ Syntrax tick completed");
        report
    }

    async fn remember_key(&self, id: i64, key: &str) {
        if let Err(e) = self.store.set_tracker_key(id, key) {
            tracing::warn!("⚠️ Could not store tracker key {key} for incident #{id}: {e}");
            return;
        }
        self.registry.lock().await.set_tracker_key(id, key);
    }
}

#[async_trait]
impl Engine for Syntrax {
    fn name(&self) -> &'static str {
        "Syntrax"
    }

    async fn tick(&self) {
        self.run_tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use breakbot_core::incident::{IncidentMachine, IncidentState};
    use breakbot_core::registry::IncidentRegistry;
    use breakbot_core::types::{Incident, LogType};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    /// Hands out `OPS-<id>` the first time it sees an incident without a key.
    #[derive(Default)]
    struct FakeTracker {
        failing: Mutex<HashSet<i64>>,
        synced: Mutex<Vec<(i64, IncidentState, usize)>>,
        created: AtomicUsize,
    }

    #[async_trait]
    impl IssueTracker for FakeTracker {
        fn name(&self) -> &str {
            "fake"
        }
        async fn init(&self) -> bool {
            true
        }
        async fn sync(
            &self,
            incident: &Incident,
            state: IncidentState,
            logs: &[LogEntry],
        ) -> Result<Option<String>> {
            if self.failing.lock().unwrap().contains(&incident.id) {
                return Err(BreakbotError::Tracker("503".into()));
            }
            if incident.tracker_key.is_none() {
                self.created.fetch_add(1, Ordering::SeqCst);
            }
            self.synced
                .lock()
                .unwrap()
                .push((incident.id, state, logs.len()));
            Ok(Some(format!("OPS-{}", incident.id)))
        }
        async fn sync_components(&self, _incident: &Incident) -> Result<Option<String>> {
            Ok(None)
        }
        async fn new_action_item(
            &self,
            _incident: &Incident,
            _text: &str,
            _author: &str,
            _context_url: Option<&str>,
        ) -> Result<Option<(String, String)>> {
            Ok(None)
        }
        async fn valid_component_names(&self, names: &[String]) -> Result<Vec<String>> {
            Ok(names.to_vec())
        }
        async fn resolve_user_id(&self, _email: &str, _chat_user_id: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct Fixture {
        store: Arc<IncidentStore>,
        registry: SharedRegistry,
        tracker: Arc<FakeTracker>,
        syntrax: Syntrax,
    }

    fn fixture_with(store: IncidentStore, max_jitter: Duration) -> Fixture {
        let store = Arc::new(store);
        let registry = IncidentRegistry::new().shared();
        let tracker = Arc::new(FakeTracker::default());
        let syntrax = Syntrax::new(
            registry.clone(),
            Arc::clone(&store),
            Some(tracker.clone() as Arc<dyn IssueTracker>),
            max_jitter,
        )
        .unwrap();
        Fixture {
            store,
            registry,
            tracker,
            syntrax,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(IncidentStore::open_in_memory().unwrap(), Duration::ZERO)
    }

    async fn declare(f: &Fixture, room: &str, live: bool) -> i64 {
        let mut incident = Incident::new(room, "errors", 2, "alice");
        incident.id = f.store.create_incident(&incident).unwrap();
        if live {
            f.registry
                .lock()
                .await
                .insert(IncidentMachine::new(incident.clone()))
                .unwrap();
        }
        incident.id
    }

    #[test]
    fn test_missing_tracker_is_fatal() {
        let store = Arc::new(IncidentStore::open_in_memory().unwrap());
        let result = Syntrax::new(
            IncidentRegistry::new().shared(),
            store,
            None,
            Duration::ZERO,
        );
        assert!(matches!(result, Err(BreakbotError::Config(_))));
    }

    #[tokio::test]
    async fn test_syncs_only_new_activity() {
        let f = fixture();
        let a = declare(&f, "C1", true).await;
        let b = declare(&f, "C2", true).await;
        f.store.add_log(a, LogType::Note, "one", None, "alice").unwrap();
        f.store.add_log(a, LogType::Event, "two", None, "alice").unwrap();

        let report = f.syntrax.run_tick().await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(*f.tracker.synced.lock().unwrap(), vec![(a, IncidentState::Started, 2)]);

        f.store.add_log(b, LogType::Note, "three", None, "bob").unwrap();
        let report = f.syntrax.run_tick().await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(
            f.tracker.synced.lock().unwrap().last().unwrap(),
            &(b, IncidentState::Started, 1)
        );

        let report = f.syntrax.run_tick().await;
        assert_eq!(report, SyncReport::default());
    }

    #[tokio::test]
    async fn test_with_watermark_picks_up_earlier_activity() {
        let store = IncidentStore::open_in_memory().unwrap();
        let mut incident = Incident::new("C1", "errors", 2, "alice");
        incident.id = store.create_incident(&incident).unwrap();
        store.add_log(incident.id, LogType::Note, "before start", None, "alice").unwrap();

        let mut f = fixture_with(store, Duration::ZERO);
        f.registry
            .lock()
            .await
            .insert(IncidentMachine::new(incident.clone()))
            .unwrap();
        assert_eq!(f.syntrax.run_tick().await.dispatched, 0);

        let since = Utc::now() - chrono::Duration::hours(1);
        f.syntrax = Syntrax::new(
            f.registry.clone(),
            Arc::clone(&f.store),
            Some(f.tracker.clone() as Arc<dyn IssueTracker>),
            Duration::ZERO,
        )
        .unwrap()
        .with_watermark(since);
        assert_eq!(f.syntrax.run_tick().await.succeeded, 1);
    }

    #[tokio::test]
    async fn test_missing_registry_entry_is_skipped() {
        let f = fixture();
        let ghost = declare(&f, "C-ghost", false).await;
        let live = declare(&f, "C1", true).await;
        f.store.add_log(ghost, LogType::Note, "x", None, "alice").unwrap();
        f.store.add_log(live, LogType::Note, "y", None, "alice").unwrap();

        let report = f.syntrax.run_tick().await;
        assert_eq!(report.missing, 1);
        assert_eq!(report.succeeded, 1);
        assert!(f.syntrax.pending_retries().is_empty());
    }

    #[tokio::test]
    async fn test_new_incident_in_same_room_is_not_merged() {
        let f = fixture();
        let first = declare(&f, "C1", true).await;
        {
            let mut registry = f.registry.lock().await;
            let live = registry.get_mut("C1").unwrap();
            live.transition(IncidentState::Canceled, Utc::now()).unwrap();
            f.store.update_incident(live.data()).unwrap();
        }
        f.store.add_log(first, LogType::Event, "Incident Canceled", None, "alice").unwrap();

        let second = declare(&f, "C1", true).await;
        f.store.add_log(second, LogType::Event, "declared", None, "bob").unwrap();

        let report = f.syntrax.run_tick().await;
        assert_eq!(report.missing, 1);
        assert_eq!(
            *f.tracker.synced.lock().unwrap(),
            vec![(second, IncidentState::Started, 1)]
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_retried() {
        let f = fixture();
        let a = declare(&f, "C1", true).await;
        let b = declare(&f, "C2", true).await;
        f.tracker.failing.lock().unwrap().insert(a);
        f.store.add_log(a, LogType::Note, "a1", None, "alice").unwrap();
        f.store.add_log(b, LogType::Note, "b1", None, "bob").unwrap();

        let before = f.syntrax.watermark();
        let report = f.syntrax.run_tick().await;
        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert!(f.syntrax.watermark() > before);
        assert_eq!(f.syntrax.pending_retries(), vec![a]);

        // No new activity, yet the failed incident is re-sent once the tracker recovers.
        f.tracker.failing.lock().unwrap().clear();
        let report = f.syntrax.run_tick().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(
            f.tracker.synced.lock().unwrap().last().unwrap(),
            &(a, IncidentState::Started, 1)
        );
        assert!(f.syntrax.pending_retries().is_empty());
    }

    #[tokio::test]
    async fn test_issue_key_is_stored_after_first_sync() {
        let f = fixture();
        let id = declare(&f, "C1", true).await;
        f.store.add_log(id, LogType::Note, "first", None, "alice").unwrap();
        f.syntrax.run_tick().await;

        let key = format!("OPS-{id}");
        let stored = f.store.load_incident(id).unwrap().unwrap();
        assert_eq!(stored.tracker_key.as_deref(), Some(key.as_str()));
        let live = f.registry.lock().await.get("C1").cloned().unwrap();
        assert_eq!(live.data().tracker_key.as_deref(), Some(key.as_str()));

        f.store.add_log(id, LogType::Note, "second", None, "alice").unwrap();
        assert_eq!(f.syntrax.run_tick().await.succeeded, 1);
        assert_eq!(f.tracker.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_calls_run_concurrently() {
        let f = fixture_with(IncidentStore::open_in_memory().unwrap(), Duration::from_secs(60));
        for room in ["C1", "C2", "C3", "C4", "C5"] {
            let id = declare(&f, room, true).await;
            f.store.add_log(id, LogType::Note, "update", None, "alice").unwrap();
        }

        let started = tokio::time::Instant::now();
        let report = f.syntrax.run_tick().await;
        let elapsed = started.elapsed();

        assert_eq!((report.dispatched, report.succeeded), (5, 5));
        // One call after another could take up to 5 × 60s.
        assert!(elapsed < Duration::from_secs(61), "took {elapsed:?}");
    }

    struct DebugCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for DebugCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == Level::DEBUG && meta.target().starts_with("breakbot_scheduler") {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_unreadable_store_still_emits_three_debug_events() {
        let dir = std::env::temp_dir().join(format!("breakbot-syntrax-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let path = dir.join("broken.db");
        let store = IncidentStore::open(&path).unwrap();
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE logs")
            .unwrap();
        let f = fixture_with(store, Duration::ZERO);

        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(DebugCounter(Arc::clone(&count)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let before = f.syntrax.watermark();
        assert_eq!(f.syntrax.run_tick().await, SyncReport::default());
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(f.syntrax.watermark(), before);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_emits_three_debug_events_per_tick_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(DebugCounter(Arc::clone(&count)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let f = fixture();
        let period = Duration::from_secs(64);
        let mut handle = spawn_engine(Arc::new(f.syntrax), period);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(period * 3 + Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);

        handle.stop();
        tokio::time::sleep(period * 5).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
