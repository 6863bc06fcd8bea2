//! Incident state machine.
//!
//! The primary lifecycle is linear:
//! ```text
//! Started → Acknowledged → Mitigated → Resolved → ReadyForReview → Completed → Archived
//!    └──────────┴─────────────┴─── (any non-terminal) ──────────────────────► Canceled
//! ```
//! `Blocked` is a side-state overlaid on the primary state: it is derived from
//! the incident's active blockers and never replaces the primary state, so
//! clearing the last blocker always reveals whatever the primary state is *now*.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BreakbotError, Result};
use crate::types::{Blocker, Incident};

/// Lifecycle state tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentState {
    Started,
    Acknowledged,
    Mitigated,
    Resolved,
    ReadyForReview,
    Completed,
    Archived,
    Canceled,
    /// Side-state: at least one blocker is active.
    Blocked,
}

impl IncidentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentState::Archived | IncidentState::Canceled)
    }

    /// Position along the primary lifecycle. `None` for Canceled/Blocked.
    fn rank(&self) -> Option<u8> {
        match self {
            IncidentState::Started => Some(0),
            IncidentState::Acknowledged => Some(1),
            IncidentState::Mitigated => Some(2),
            IncidentState::Resolved => Some(3),
            IncidentState::ReadyForReview => Some(4),
            IncidentState::Completed => Some(5),
            IncidentState::Archived => Some(6),
            IncidentState::Canceled | IncidentState::Blocked => None,
        }
    }

    /// Whether a primary transition `self → to` is allowed.
    ///
    /// Before resolution milestones may be skipped (resolving straight from
    /// Started is fine). After resolution the review path is followed in order,
    /// except that review may be skipped and a stale ReadyForReview may be archived.
    pub fn can_transition_to(&self, to: IncidentState) -> bool {
        if self.is_terminal() || *self == IncidentState::Blocked {
            return false;
        }
        if to == IncidentState::Canceled {
            return true;
        }
        let (Some(from_rank), Some(to_rank)) = (self.rank(), to.rank()) else {
            return false;
        };
        if to_rank <= from_rank {
            return false;
        }
        match self {
            IncidentState::Started | IncidentState::Acknowledged | IncidentState::Mitigated => {
                matches!(
                    to,
                    IncidentState::Acknowledged | IncidentState::Mitigated | IncidentState::Resolved
                )
            }
            IncidentState::Resolved => matches!(
                to,
                IncidentState::ReadyForReview | IncidentState::Completed
            ),
            IncidentState::ReadyForReview => {
                matches!(to, IncidentState::Completed | IncidentState::Archived)
            }
            IncidentState::Completed => to == IncidentState::Archived,
            _ => false,
        }
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IncidentState::Started => "Started",
            IncidentState::Acknowledged => "Acknowledged",
            IncidentState::Mitigated => "Mitigated",
            IncidentState::Resolved => "Resolved",
            IncidentState::ReadyForReview => "ReadyForReview",
            IncidentState::Completed => "Completed",
            IncidentState::Archived => "Archived",
            IncidentState::Canceled => "Canceled",
            IncidentState::Blocked => "Blocked",
        };
        f.write_str(s)
    }
}

/// True until the incident is resolved. Gates commands that need an ongoing incident.
pub fn is_active(incident: &Incident) -> bool {
    incident.resolved_at.is_none()
}

/// True until the incident is archived or canceled. Gates post-resolution edits.
pub fn is_updatable(incident: &Incident) -> bool {
    incident.archived_at.is_none() && incident.canceled_at.is_none()
}

/// An incident wrapped with its primary lifecycle state.
///
/// The machine never persists anything; callers write to storage first and
/// then reflect the change here.
#[derive(Debug, Clone)]
pub struct IncidentMachine {
    data: Incident,
    primary: IncidentState,
}

impl IncidentMachine {
    /// Wrap an incident, deriving the primary state from its milestones.
    pub fn new(data: Incident) -> Self {
        let primary = derive_primary(&data);
        Self { data, primary }
    }

    pub fn data(&self) -> &Incident {
        &self.data
    }

    /// Mutable view. Changes made here are not persisted.
    pub fn data_mut(&mut self) -> &mut Incident {
        &mut self.data
    }

    pub fn into_data(self) -> Incident {
        self.data
    }

    /// Primary state, ignoring blockers.
    pub fn primary_state(&self) -> IncidentState {
        self.primary
    }

    /// Current state tag: terminal states win, then Blocked, then the primary state.
    pub fn state(&self) -> IncidentState {
        if self.primary.is_terminal() {
            self.primary
        } else if self.data.is_blocked() {
            IncidentState::Blocked
        } else {
            self.primary
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.primary.is_terminal() && self.data.is_blocked()
    }

    /// Validate a transition without applying it.
    pub fn check_transition(&self, to: IncidentState) -> Result<()> {
        if self.primary.can_transition_to(to) {
            Ok(())
        } else {
            Err(BreakbotError::InvalidTransition {
                from: self.primary,
                to,
            })
        }
    }

    /// Move to a new primary state, stamping its milestone if still unset.
    /// On error nothing changes.
    pub fn transition(&mut self, to: IncidentState, at: DateTime<Utc>) -> Result<()> {
        self.check_transition(to)?;
        let at = self.latest_milestone().map_or(at, |latest| at.max(latest));
        if let Some(slot) = milestone_mut(&mut self.data, to) {
            slot.get_or_insert(at);
        }
        self.data.updated_at = at;
        self.primary = to;
        Ok(())
    }

    /// Record a new blocker. Joining an already-blocked incident just adds to the set.
    pub fn block(&mut self, blocker: Blocker) {
        self.data.blockers.push(blocker);
    }

    /// Clear active blockers matching `whomst` (all active ones when `None`).
    /// Returns how many were cleared.
    pub fn unblock(&mut self, whomst: Option<&str>, at: DateTime<Utc>) -> usize {
        let mut cleared = 0;
        for blocker in self.data.blockers.iter_mut().filter(|b| b.is_active()) {
            if whomst.is_none_or(|w| w.eq_ignore_ascii_case(&blocker.whomst)) {
                blocker.unblocked_at = Some(at);
                cleared += 1;
            }
        }
        cleared
    }

    fn latest_milestone(&self) -> Option<DateTime<Utc>> {
        let d = &self.data;
        [
            d.acknowledged_at,
            d.mitigated_at,
            d.resolved_at,
            d.ready_for_review_at,
            d.completed_at,
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

fn derive_primary(d: &Incident) -> IncidentState {
    if d.canceled_at.is_some() {
        IncidentState::Canceled
    } else if d.archived_at.is_some() {
        IncidentState::Archived
    } else if d.completed_at.is_some() {
        IncidentState::Completed
    } else if d.ready_for_review_at.is_some() {
        IncidentState::ReadyForReview
    } else if d.resolved_at.is_some() {
        IncidentState::Resolved
    } else if d.mitigated_at.is_some() {
        IncidentState::Mitigated
    } else if d.acknowledged_at.is_some() {
        IncidentState::Acknowledged
    } else {
        IncidentState::Started
    }
}

fn milestone_mut(d: &mut Incident, state: IncidentState) -> Option<&mut Option<DateTime<Utc>>> {
    match state {
        IncidentState::Acknowledged => Some(&mut d.acknowledged_at),
        IncidentState::Mitigated => Some(&mut d.mitigated_at),
        IncidentState::Resolved => Some(&mut d.resolved_at),
        IncidentState::ReadyForReview => Some(&mut d.ready_for_review_at),
        IncidentState::Completed => Some(&mut d.completed_at),
        IncidentState::Archived => Some(&mut d.archived_at),
        IncidentState::Canceled => Some(&mut d.canceled_at),
        IncidentState::Started | IncidentState::Blocked => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn machine() -> IncidentMachine {
        IncidentMachine::new(Incident::new("C42", "api 500s", 1, "alice"))
    }

    fn blocker(whomst: &str) -> Blocker {
        Blocker {
            id: 0,
            incident_id: 0,
            whomst: whomst.into(),
            reason: None,
            created_at: Utc::now(),
            unblocked_at: None,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut m = machine();
        let now = Utc::now();
        assert_eq!(m.state(), IncidentState::Started);
        for to in [
            IncidentState::Acknowledged,
            IncidentState::Mitigated,
            IncidentState::Resolved,
            IncidentState::ReadyForReview,
            IncidentState::Completed,
            IncidentState::Archived,
        ] {
            m.transition(to, now).unwrap();
            assert_eq!(m.state(), to);
        }
        assert!(m.data().archived_at.is_some());
        assert!(!is_updatable(m.data()));
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut m = machine();
        let err = m.transition(IncidentState::Completed, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            BreakbotError::InvalidTransition {
                from: IncidentState::Started,
                to: IncidentState::Completed
            }
        ));
        assert_eq!(m.state(), IncidentState::Started);
        assert!(m.data().completed_at.is_none());

        m.transition(IncidentState::Mitigated, Utc::now()).unwrap();
        assert!(m.transition(IncidentState::Acknowledged, Utc::now()).is_err());
        assert!(m.transition(IncidentState::Blocked, Utc::now()).is_err());
        assert_eq!(m.state(), IncidentState::Mitigated);
    }

    #[test]
    fn test_resolve_may_skip_milestones() {
        let mut m = machine();
        m.transition(IncidentState::Resolved, Utc::now()).unwrap();
        assert!(m.data().acknowledged_at.is_none());
        assert!(!is_active(m.data()));
        assert!(is_updatable(m.data()));
    }

    #[test]
    fn test_cancel_is_terminal() {
        let mut m = machine();
        m.transition(IncidentState::Acknowledged, Utc::now()).unwrap();
        m.transition(IncidentState::Canceled, Utc::now()).unwrap();
        assert_eq!(m.state(), IncidentState::Canceled);
        assert!(m.transition(IncidentState::Archived, Utc::now()).is_err());
        assert!(m.transition(IncidentState::Canceled, Utc::now()).is_err());
        assert!(m.data().archived_at.is_none());
        assert!(!is_updatable(m.data()));
    }

    #[test]
    fn test_blocked_side_state_joins_and_restores_current_primary() {
        let mut m = machine();
        m.block(blocker("vendor"));
        assert_eq!(m.state(), IncidentState::Blocked);
        m.block(blocker("dba"));
        assert_eq!(m.state(), IncidentState::Blocked);

        // Advanced independently while blocked.
        m.transition(IncidentState::Resolved, Utc::now()).unwrap();
        assert_eq!(m.state(), IncidentState::Blocked);
        assert_eq!(m.primary_state(), IncidentState::Resolved);

        assert_eq!(m.unblock(Some("VENDOR"), Utc::now()), 1);
        assert_eq!(m.state(), IncidentState::Blocked);
        assert_eq!(m.unblock(None, Utc::now()), 1);
        assert_eq!(m.state(), IncidentState::Resolved);
        assert_eq!(m.unblock(None, Utc::now()), 0);
    }

    #[test]
    fn test_milestones_set_once_and_monotonic() {
        let mut m = machine();
        let now = Utc::now();
        m.transition(IncidentState::Mitigated, now).unwrap();
        // Clock skew: resolution stamped earlier than mitigation gets clamped.
        m.transition(IncidentState::Resolved, now - Duration::minutes(5)).unwrap();
        assert_eq!(m.data().resolved_at, Some(now));
    }

    #[test]
    fn test_derive_state_on_reload() {
        let mut inc = Incident::new("C1", "x", 2, "bob");
        inc.resolved_at = Some(Utc::now());
        inc.ready_for_review_at = Some(Utc::now());
        let m = IncidentMachine::new(inc);
        assert_eq!(m.state(), IncidentState::ReadyForReview);
    }

    #[test]
    fn test_active_and_updatable_predicates() {
        let mut inc = Incident::new("C1", "x", 2, "bob");
        assert!(is_active(&inc) && is_updatable(&inc));
        inc.archived_at = Some(Utc::now());
        assert!(is_active(&inc));
        assert!(!is_updatable(&inc));
    }
}
