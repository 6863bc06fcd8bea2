//! Which lifecycle predicate a command requires.

use breakbot_core::error::{BreakbotError, Result};
use breakbot_core::incident::{IncidentMachine, is_active, is_updatable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Only while the incident is unresolved.
    Active,
    /// Until the incident is archived or canceled.
    Updatable,
    /// Checked by the state machine itself.
    Transition,
}

impl Gate {
    pub fn check(self, machine: &IncidentMachine) -> Result<()> {
        let data = machine.data();
        match self {
            Gate::Active if !is_active(data) || !is_updatable(data) => {
                Err(BreakbotError::NotActive(data.chat_room.clone()))
            }
            Gate::Updatable if !is_updatable(data) => {
                Err(BreakbotError::NotUpdatable(data.chat_room.clone()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breakbot_core::incident::IncidentState;
    use breakbot_core::types::Incident;
    use chrono::Utc;

    #[test]
    fn test_gates_follow_lifecycle() {
        let mut m = IncidentMachine::new(Incident::new("C1", "t", 3, "alice"));
        assert!(Gate::Active.check(&m).is_ok());

        m.transition(IncidentState::Resolved, Utc::now()).unwrap();
        assert!(matches!(Gate::Active.check(&m), Err(BreakbotError::NotActive(_))));
        assert!(Gate::Updatable.check(&m).is_ok());

        m.transition(IncidentState::Canceled, Utc::now()).unwrap();
        assert!(matches!(Gate::Updatable.check(&m), Err(BreakbotError::NotUpdatable(_))));
        assert!(Gate::Transition.check(&m).is_ok());
    }
}
