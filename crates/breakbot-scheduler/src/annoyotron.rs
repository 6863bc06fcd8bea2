//! Annoyotron: posts reminders into rooms whose incidents have stalled.
//!
//! A condition that stays true is repeated once per threshold, not once per tick:
//! after a reminder for `(room, kind)` is delivered, the next one waits until the
//! threshold has elapsed again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use breakbot_core::config::{BreakbotConfig, NagKind};
use breakbot_core::registry::SharedRegistry;
use breakbot_core::traits::ChatAdapter;
use chrono::{DateTime, Utc};

use crate::engine::Engine;
use crate::nag::{Nag, due_nags};
use crate::notify::NagNotice;

/// The escalation engine.
pub struct Annoyotron {
    registry: SharedRegistry,
    chat: Arc<dyn ChatAdapter>,
    config: Arc<BreakbotConfig>,
    last_nag: Mutex<HashMap<(String, NagKind), DateTime<Utc>>>,
}

impl Annoyotron {
    pub fn new(registry: SharedRegistry, chat: Arc<dyn ChatAdapter>, config: Arc<BreakbotConfig>) -> Self {
        Self {
            registry,
            chat,
            config,
            last_nag: Mutex::new(HashMap::new()),
        }
    }

    fn last_nags(&self) -> std::sync::MutexGuard<'_, HashMap<(String, NagKind), DateTime<Utc>>> {
        self.last_nag.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn repeat_due(&self, room: &str, nag: &Nag, now: DateTime<Utc>) -> bool {
        match self.last_nags().get(&(room.to_string(), nag.kind)) {
            None => true,
            Some(last) => (now - *last).num_seconds() >= nag.threshold_secs as i64,
        }
    }

    /// Evaluate every live incident at `now` and send what is due.
    /// Returns the number of reminders delivered.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let snapshot = self.registry.lock().await.snapshot();

        // Conditions that no longer hold reset their cadence.
        {
            let live: std::collections::HashSet<&str> =
                snapshot.iter().map(|m| m.data().chat_room.as_str()).collect();
            self.last_nags().retain(|(room, _), _| live.contains(room.as_str()));
        }

        let mut notices = Vec::new();
        for machine in &snapshot {
            let incident = machine.data();
            let Some(priority) = self.config.priority(incident.priority) else {
                tracing::warn!(
                    "⚠️ Incident #{} has unknown priority {}; not nagging",
                    incident.id,
                    incident.priority
                );
                continue;
            };
            let due = due_nags(machine, &priority.nag, now);
            {
                let mut last = self.last_nags();
                last.retain(|(room, kind), _| {
                    room != &incident.chat_room || due.iter().any(|n| n.kind == *kind)
                });
            }
            for nag in due {
                if self.repeat_due(&incident.chat_room, &nag, now) {
                    notices.push(NagNotice::new(&incident.chat_room, priority, &nag));
                }
            }
        }

        if notices.is_empty() {
            return 0;
        }
        tracing::debug!("📣 Annoyotron sending {} reminders", notices.len());

        let handles: Vec<_> = notices
            .into_iter()
            .map(|notice| {
                let chat = Arc::clone(&self.chat);
                tokio::spawn(async move {
                    let result = chat.send(&notice.room, &notice.text).await;
                    (notice, result)
                })
            })
            .collect();

        let mut delivered = 0;
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok((notice, Ok(_))) => {
                    self.last_nags().insert((notice.room, notice.kind), now);
                    delivered += 1;
                }
                Ok((notice, Err(e))) => {
                    tracing::warn!("⚠️ Failed to nag room {} ({}): {e}", notice.room, notice.kind);
                }
                Err(e) => tracing::warn!("⚠️ Nag task aborted: {e}"),
            }
        }
        delivered
    }
}

#[async_trait]
impl Engine for Annoyotron {
    fn name(&self) -> &'static str {
        "Annoyotron"
    }

    async fn tick(&self) {
        self.tick_at(Utc::now()).await;
    }
}
