//! Archivist: retires incidents that have sat past review for the retention period.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use breakbot_core::incident::{IncidentMachine, IncidentState};
use breakbot_core::registry::SharedRegistry;
use breakbot_core::traits::ChatAdapter;
use breakbot_db::IncidentStore;
use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinSet;

use crate::engine::Engine;

/// The archival engine.
pub struct Archivist {
    registry: SharedRegistry,
    store: Arc<IncidentStore>,
    chat: Option<Arc<dyn ChatAdapter>>,
    retention: Duration,
    /// Detached `leave` calls still in flight.
    leaving: Mutex<JoinSet<()>>,
}

impl Archivist {
    pub fn new(
        registry: SharedRegistry,
        store: Arc<IncidentStore>,
        chat: Option<Arc<dyn ChatAdapter>>,
        retention: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            chat,
            retention,
            leaving: Mutex::new(JoinSet::new()),
        }
    }

    fn leaving(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.leaving.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// When the incident's retention clock started, if it is in an archivable state.
    fn retention_start(machine: &IncidentMachine) -> Option<DateTime<Utc>> {
        let data = machine.data();
        match machine.primary_state() {
            IncidentState::Completed => data.completed_at,
            IncidentState::ReadyForReview => {
                let rfr = data.ready_for_review_at?;
                Some(data.last_activity().map_or(rfr, |last| last.max(rfr)))
            }
            _ => None,
        }
    }

    pub fn is_eligible(&self, machine: &IncidentMachine, now: DateTime<Utc>) -> bool {
        Self::retention_start(machine).is_some_and(|start| start + self.retention <= now)
    }

    /// Archive every eligible incident. Returns how many were archived.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<IncidentMachine> = self
            .registry
            .lock()
            .await
            .snapshot()
            .into_iter()
            .filter(|m| self.is_eligible(m, now))
            .collect();

        let mut archived = 0;
        for machine in candidates {
            if self.archive(machine, now).await {
                archived += 1;
            }
        }
        archived
    }

    async fn archive(&self, machine: IncidentMachine, now: DateTime<Utc>) -> bool {
        let id = machine.data().id;
        let room = machine.data().chat_room.clone();

        let written = match self.store.archive_incident(id, now) {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!("⚠️ Failed to archive incident #{id}: {e}");
                return false;
            }
        };

        {
            let mut registry = self.registry.lock().await;
            let still_same = registry.get(&room).is_some_and(|m| m.data().id == id);
            if still_same {
                if let Some(live) = registry.get_mut(&room) {
                    if let Err(e) = live.transition(IncidentState::Archived, now) {
                        tracing::warn!("⚠️ Incident #{id} archived in storage but not in memory: {e}");
                    }
                }
                registry.remove(&room);
            }
        }

        if !written {
            tracing::debug!("Incident #{id} was already archived");
            return false;
        }
        tracing::info!("🗄️ Archived incident #{id} ({room})");

        if let Some(chat) = &self.chat {
            let chat = Arc::clone(chat);
            let mut leaving = self.leaving();
            while leaving.try_join_next().is_some() {}
            leaving.spawn(async move {
                if let Err(e) = chat.leave(&room).await {
                    tracing::warn!("⚠️ Failed to leave room {room}: {e}");
                }
            });
        }
        true
    }
}

#[async_trait]
impl Engine for Archivist {
    fn name(&self) -> &'static str {
        "Archivist"
    }

    async fn tick(&self) {
        self.tick_at(Utc::now()).await;
    }

    async fn settle(&self) {
        let mut pending = std::mem::take(&mut *self.leaving());
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                tracing::warn!("⚠️ Leave task ended abnormally: {e}");
            }
        }
    }
}
