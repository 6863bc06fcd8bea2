//! Incident commands.
//!
//! Each operation takes the registry lock, checks its [`Gate`], writes to the
//! store and then mirrors the write into the live incident. Collaborator calls
//! (tracker, report platform) are made on a snapshot, outside the lock.

use std::sync::Arc;

use breakbot_core::config::BreakbotConfig;
use breakbot_core::error::{BreakbotError, Result};
use breakbot_core::incident::{IncidentMachine, IncidentState, is_updatable};
use breakbot_core::registry::SharedRegistry;
use breakbot_core::traits::{IssueTracker, ReportPlatform};
use breakbot_core::types::{Blocker, ChatUser, Incident, LogEntry, LogType, Role, UserCacheEntry};
use breakbot_db::{AddOutcome, IncidentStore, RemoveOutcome};
use chrono::Utc;

use crate::gate::Gate;

/// What happened to each requested component.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ComponentChanges {
    pub added: Vec<String>,
    pub duplicate: Vec<String>,
    /// Names the tracker does not know about. Nothing is stored for these.
    pub invalid: Vec<String>,
}

/// Handler-facing incident operations.
pub struct IncidentCommands {
    registry: SharedRegistry,
    store: Arc<IncidentStore>,
    config: Arc<BreakbotConfig>,
    tracker: Option<Arc<dyn IssueTracker>>,
    reporter: Option<Arc<dyn ReportPlatform>>,
}

fn not_found(room: &str) -> BreakbotError {
    BreakbotError::NotFound(format!("no incident in room {room}"))
}

impl IncidentCommands {
    pub fn new(registry: SharedRegistry, store: Arc<IncidentStore>, config: Arc<BreakbotConfig>) -> Self {
        Self {
            registry,
            store,
            config,
            tracker: None,
            reporter: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Option<Arc<dyn IssueTracker>>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_reporter(mut self, reporter: Option<Arc<dyn ReportPlatform>>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Run `f` against the live incident in `room` while holding the registry lock.
    async fn with_live<T, F>(&self, room: &str, gate: Gate, f: F) -> Result<T>
    where
        F: FnOnce(&IncidentStore, &mut IncidentMachine) -> Result<T>,
    {
        let mut registry = self.registry.lock().await;
        let live = registry.get_mut(room).ok_or_else(|| not_found(room))?;
        gate.check(live)?;
        f(self.store.as_ref(), live)
    }

    /// Apply `edit` to a copy, persist the copy, then swap it in.
    async fn update_row<F>(&self, room: &str, gate: Gate, edit: F) -> Result<Incident>
    where
        F: FnOnce(&mut Incident),
    {
        self.with_live(room, gate, |store, live| {
            let mut next = live.clone();
            edit(next.data_mut());
            next.data_mut().updated_at = Utc::now();
            store.update_incident(next.data())?;
            *live = next;
            Ok(live.data().clone())
        })
        .await
    }

    /// Owned copy of the live incident, for collaborator calls.
    async fn snapshot(&self, room: &str, gate: Gate) -> Result<Incident> {
        self.with_live(room, gate, |_, live| Ok(live.data().clone())).await
    }

    // ─── Declaration ────────────────────────────────────────

    /// Declare a new incident in `room`. Uses the configured default priority when none is given.
    pub async fn declare(
        &self,
        room: &str,
        title: &str,
        priority: Option<i64>,
        declared_by: &str,
    ) -> Result<Incident> {
        let priority = priority.unwrap_or(self.config.default_priority);
        let priority_name = self.config.validate_priority(priority)?.name.clone();

        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(room).filter(|m| is_updatable(m.data())) {
            return Err(BreakbotError::Conflict(format!(
                "room {room} already hosts incident #{}",
                existing.data().id
            )));
        }

        let mut incident = Incident::new(room, title, priority, declared_by);
        let (id, entry) = self.store.create_with_log(
            &incident,
            LogType::Event,
            &format!("{priority_name} incident declared: {title}"),
            declared_by,
        )?;
        incident.id = id;
        incident.logs.push(entry);
        registry.insert(IncidentMachine::new(incident.clone()))?;

        tracing::info!("🚨 Incident #{} declared in {} ({}): {}", incident.id, room, priority_name, title);
        Ok(incident)
    }

    // ─── Row fields ─────────────────────────────────────────

    pub async fn set_priority(&self, room: &str, priority: i64, by: &str) -> Result<Incident> {
        let name = self.config.validate_priority(priority)?.name.clone();
        let incident = self
            .update_row(room, Gate::Updatable, |inc| inc.priority = priority)
            .await?;
        self.log(room, LogType::Priority, &format!("Priority set to {name}"), None, by)
            .await?;
        Ok(incident)
    }

    /// Assign (or clear, with `None`) one of the incident roles.
    pub async fn assign_role(&self, room: &str, role: Role, who: Option<&str>, by: &str) -> Result<Incident> {
        let incident = self
            .update_row(room, Gate::Active, |inc| inc.set_role(role, who.map(str::to_string)))
            .await?;
        let text = match who {
            Some(who) => format!("{who} is now {role}"),
            None => format!("{role} cleared"),
        };
        self.log(room, LogType::Event, &text, None, by).await?;
        Ok(incident)
    }

    pub async fn set_title(&self, room: &str, title: &str) -> Result<Incident> {
        self.update_row(room, Gate::Updatable, |inc| inc.title = title.to_string())
            .await
    }

    pub async fn set_summary(&self, room: &str, summary: &str, by: &str) -> Result<Incident> {
        let incident = self
            .update_row(room, Gate::Updatable, |inc| inc.summary = Some(summary.to_string()))
            .await?;
        self.log(room, LogType::Summary, summary, None, by).await?;
        Ok(incident)
    }

    // ─── Affected / components ──────────────────────────────

    pub async fn add_affected(&self, room: &str, what: &str, by: &str) -> Result<AddOutcome> {
        self.with_live(room, Gate::Updatable, |store, live| {
            let id = live.data().id;
            let outcome = store.add_affected(id, what)?;
            if outcome == AddOutcome::Added {
                let entry = store.add_log(id, LogType::Affected, &format!("Affected: {what}"), None, by)?;
                let data = live.data_mut();
                data.affected.push(what.to_string());
                data.logs.push(entry);
            }
            Ok(outcome)
        })
        .await
    }

    pub async fn remove_affected(&self, room: &str, what: &str) -> Result<RemoveOutcome> {
        self.with_live(room, Gate::Updatable, |store, live| {
            let outcome = store.remove_affected(live.data().id, what)?;
            if outcome == RemoveOutcome::Removed {
                live.data_mut().affected.retain(|a| a != what);
            }
            Ok(outcome)
        })
        .await
    }

    /// Add components, keeping only names the tracker recognises when one is configured.
    pub async fn add_components(&self, room: &str, names: &[String], by: &str) -> Result<ComponentChanges> {
        self.snapshot(room, Gate::Updatable).await?;

        let valid = match &self.tracker {
            Some(tracker) => tracker.valid_component_names(names).await?,
            None => names.to_vec(),
        };
        let mut changes = ComponentChanges {
            invalid: names
                .iter()
                .filter(|n| !valid.iter().any(|v| v.eq_ignore_ascii_case(n)))
                .cloned()
                .collect(),
            ..Default::default()
        };

        changes = self
            .with_live(room, Gate::Updatable, move |store, live| {
                let id = live.data().id;
                for name in valid {
                    match store.add_component(id, &name)? {
                        AddOutcome::Added => {
                            let entry =
                                store.add_log(id, LogType::Component, &format!("Component: {name}"), None, by)?;
                            let data = live.data_mut();
                            data.components.push(name.clone());
                            data.logs.push(entry);
                            changes.added.push(name);
                        }
                        AddOutcome::Duplicate => changes.duplicate.push(name),
                    }
                }
                Ok(changes)
            })
            .await?;

        if !changes.added.is_empty() {
            self.sync_components(room).await;
        }
        Ok(changes)
    }

    pub async fn remove_component(&self, room: &str, name: &str) -> Result<RemoveOutcome> {
        let outcome = self
            .with_live(room, Gate::Updatable, |store, live| {
                let outcome = store.remove_component(live.data().id, name)?;
                if outcome == RemoveOutcome::Removed {
                    live.data_mut().components.retain(|c| c != name);
                }
                Ok(outcome)
            })
            .await?;
        if outcome == RemoveOutcome::Removed {
            self.sync_components(room).await;
        }
        Ok(outcome)
    }

    async fn sync_components(&self, room: &str) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let incident = match self.snapshot(room, Gate::Transition).await {
            Ok(incident) => incident,
            Err(e) => {
                tracing::warn!("⚠️ Component sync skipped for {room}: {e}");
                return;
            }
        };
        match tracker.sync_components(&incident).await {
            Ok(Some(key)) if incident.tracker_key.is_none() => {
                if let Err(e) = self.store.set_tracker_key(incident.id, &key) {
                    tracing::warn!("⚠️ Could not store tracker key {key} for incident #{}: {e}", incident.id);
                    return;
                }
                self.registry.lock().await.set_tracker_key(incident.id, &key);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("⚠️ Failed to sync components for incident #{}: {e}", incident.id);
            }
        }
    }

    // ─── Blockers ───────────────────────────────────────────

    pub async fn block(&self, room: &str, whomst: &str, reason: Option<&str>, by: &str) -> Result<Blocker> {
        self.with_live(room, Gate::Active, |store, live| {
            let id = live.data().id;
            let blocker = store.add_blocker(id, whomst, reason)?;
            let text = match reason {
                Some(reason) => format!("Blocked on {whomst}: {reason}"),
                None => format!("Blocked on {whomst}"),
            };
            let entry = store.add_log(id, LogType::Blocker, &text, None, by)?;
            live.block(blocker.clone());
            live.data_mut().logs.push(entry);
            Ok(blocker)
        })
        .await
    }

    /// Clear active blockers matching `whomst` (all when `None`). Returns how many cleared.
    pub async fn unblock(&self, room: &str, whomst: Option<&str>, by: &str) -> Result<usize> {
        self.with_live(room, Gate::Updatable, |store, live| {
            let id = live.data().id;
            let now = Utc::now();
            let cleared = store.unblock(id, whomst, now)?;
            if cleared == 0 {
                return Ok(0);
            }
            let text = match whomst {
                Some(w) => format!("Unblocked from {w}"),
                None => "All blockers cleared".to_string(),
            };
            let entry = store.add_log(id, LogType::Unblock, &text, None, by)?;
            live.unblock(whomst, now);
            live.data_mut().logs.push(entry);
            Ok(cleared)
        })
        .await
    }

    // ─── Log ────────────────────────────────────────────────

    pub async fn log(
        &self,
        room: &str,
        kind: LogType,
        text: &str,
        context_url: Option<&str>,
        by: &str,
    ) -> Result<LogEntry> {
        self.with_live(room, Gate::Updatable, |store, live| {
            let entry = store.add_log(live.data().id, kind, text, context_url, by)?;
            live.data_mut().logs.push(entry.clone());
            Ok(entry)
        })
        .await
    }

    // ─── Transitions ────────────────────────────────────────

    /// Move the incident to `to`, stamping its milestone.
    pub async fn transition(&self, room: &str, to: IncidentState, by: &str) -> Result<IncidentState> {
        let state = self
            .with_live(room, Gate::Transition, |store, live| {
                let mut next = live.clone();
                next.transition(to, Utc::now())?;
                let entry = store.update_with_log(next.data(), LogType::Event, &format!("Incident {to}"), by)?;
                next.data_mut().logs.push(entry);
                *live = next;
                Ok(live.state())
            })
            .await?;
        tracing::info!("📌 Incident in {room} is now {to}");
        Ok(state)
    }

    pub async fn acknowledge(&self, room: &str, by: &str) -> Result<IncidentState> {
        self.transition(room, IncidentState::Acknowledged, by).await
    }

    pub async fn mitigate(&self, room: &str, by: &str) -> Result<IncidentState> {
        self.transition(room, IncidentState::Mitigated, by).await
    }

    pub async fn resolve(&self, room: &str, by: &str) -> Result<IncidentState> {
        self.transition(room, IncidentState::Resolved, by).await
    }

    pub async fn ready_for_review(&self, room: &str, by: &str) -> Result<IncidentState> {
        self.transition(room, IncidentState::ReadyForReview, by).await
    }

    pub async fn complete(&self, room: &str, by: &str) -> Result<IncidentState> {
        self.transition(room, IncidentState::Completed, by).await
    }

    pub async fn cancel(&self, room: &str, by: &str) -> Result<IncidentState> {
        self.transition(room, IncidentState::Canceled, by).await
    }

    // ─── Collaborators ──────────────────────────────────────

    /// File a follow-up item in the tracker and log it. `None` when the tracker declined.
    pub async fn action_item(
        &self,
        room: &str,
        text: &str,
        by: &str,
        context_url: Option<&str>,
    ) -> Result<Option<(String, String)>> {
        let tracker = self
            .tracker
            .as_ref()
            .ok_or_else(|| BreakbotError::Config("no issue tracker configured".into()))?;
        let incident = self.snapshot(room, Gate::Updatable).await?;

        let created = tracker.new_action_item(&incident, text, by, context_url).await?;
        if let Some((key, url)) = &created {
            self.log(room, LogType::ActionItem, &format!("{key}: {text}"), Some(url), by)
                .await?;
        }
        Ok(created)
    }

    /// Draft the post-incident report. Returns where the draft lives.
    pub async fn draft_report(&self, room: &str, by: &str) -> Result<String> {
        let reporter = self
            .reporter
            .as_ref()
            .ok_or_else(|| BreakbotError::Config("no report platform configured".into()))?;
        let incident = self.snapshot(room, Gate::Updatable).await?;
        let logs = self.store.logs_for(incident.id)?;

        let location = reporter.draft(&incident, &logs, by).await?;
        self.log(room, LogType::Event, "Report drafted", Some(&location), by)
            .await?;
        tracing::info!("📝 Report for incident #{} drafted at {}", incident.id, location);
        Ok(location)
    }

    /// Cache the tracker and report ids for a chat user, resolving only what is missing.
    pub async fn remember_user(&self, user: &ChatUser) -> Result<UserCacheEntry> {
        let cached = self.store.get_user(&user.id)?.unwrap_or_default();
        let mut entry = UserCacheEntry {
            chat_user_id: user.id.clone(),
            name: Some(user.name.clone()),
            updated_at: Some(Utc::now()),
            ..cached
        };

        if let Some(email) = user.email.as_deref() {
            if entry.tracker_user_id.is_none() {
                if let Some(tracker) = &self.tracker {
                    entry.tracker_user_id = tracker.resolve_user_id(email, &user.id).await?;
                }
            }
            if entry.report_user_id.is_none() {
                if let Some(reporter) = &self.reporter {
                    entry.report_user_id = reporter.resolve_user_id(email, &user.id).await?;
                }
            }
        }

        self.store.upsert_user(&entry)?;
        Ok(entry)
    }
}
