//! Nag rules: which stall conditions an incident has crossed.
//!
//! Elapsed time is always measured from the triggering event recorded on the
//! incident (creation, last comm update, last log entry), never from a
//! block/unblock boundary.

use breakbot_core::config::{NagKind, NagThresholds};
use breakbot_core::incident::{IncidentMachine, is_active, is_updatable};
use breakbot_core::types::{Incident, LogType};
use chrono::{DateTime, Utc};

/// A stall condition that is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nag {
    pub kind: NagKind,
    pub elapsed_secs: u64,
    pub threshold_secs: u64,
}

/// When the clock for `kind` started, or `None` if the condition does not apply.
pub fn since(incident: &Incident, kind: NagKind) -> Option<DateTime<Utc>> {
    match kind {
        NagKind::NeedsInitialComm => match incident.last_log_of(LogType::CommUpdate) {
            None => Some(incident.created_at),
            Some(_) => None,
        },
        NagKind::NeedsCommUpdate => incident
            .last_log_of(LogType::CommUpdate)
            .map(|l| l.created_at),
        NagKind::NoPoint => match incident.point {
            None => Some(incident.created_at),
            Some(_) => None,
        },
        NagKind::NoComms => Some(incident.last_activity().unwrap_or(incident.created_at)),
    }
}

/// Whether the escalation engine looks at this incident at all.
pub fn is_naggable(machine: &IncidentMachine) -> bool {
    let data = machine.data();
    is_active(data) && is_updatable(data) && !machine.is_blocked()
}

/// Every condition whose elapsed time has reached its configured threshold.
/// Conditions without a threshold never fire.
pub fn due_nags(machine: &IncidentMachine, thresholds: &NagThresholds, now: DateTime<Utc>) -> Vec<Nag> {
    if !is_naggable(machine) {
        return Vec::new();
    }
    NagKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let threshold_secs = thresholds.get(kind)?;
            let started = since(machine.data(), kind)?;
            let elapsed_secs = (now - started).num_seconds().max(0) as u64;
            (elapsed_secs >= threshold_secs).then_some(Nag {
                kind,
                elapsed_secs,
                threshold_secs,
            })
        })
        .collect()
}
