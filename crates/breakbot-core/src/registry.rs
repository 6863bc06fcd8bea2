//! In-memory incident registry: chat room → incident state machine.
//!
//! Shared by command handlers and the background engines. Access goes through
//! a `tokio::sync::Mutex`; holders must not keep the guard across external
//! calls, so engines take a [`snapshot`](IncidentRegistry::snapshot) and release.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{BreakbotError, Result};
use crate::incident::{IncidentMachine, is_updatable};

pub type SharedRegistry = Arc<Mutex<IncidentRegistry>>;

/// Live incidents keyed by chat room.
#[derive(Debug, Default)]
pub struct IncidentRegistry {
    incidents: HashMap<String, IncidentMachine>,
}

impl IncidentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap into the shared handle handed to handlers and engines.
    pub fn shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    /// Register an incident. A room may only host one updatable incident.
    pub fn insert(&mut self, machine: IncidentMachine) -> Result<()> {
        let room = machine.data().chat_room.clone();
        if let Some(existing) = self.incidents.get(&room).filter(|m| is_updatable(m.data())) {
            return Err(BreakbotError::Conflict(format!(
                "room {room} already hosts incident #{}",
                existing.data().id
            )));
        }
        self.incidents.insert(room, machine);
        Ok(())
    }

    pub fn get(&self, room: &str) -> Option<&IncidentMachine> {
        self.incidents.get(room)
    }

    pub fn get_mut(&mut self, room: &str) -> Option<&mut IncidentMachine> {
        self.incidents.get_mut(room)
    }

    pub fn remove(&mut self, room: &str) -> Option<IncidentMachine> {
        self.incidents.remove(room)
    }

    pub fn contains(&self, room: &str) -> bool {
        self.incidents.contains_key(room)
    }

    pub fn find_by_id(&self, id: i64) -> Option<&IncidentMachine> {
        self.incidents.values().find(|m| m.data().id == id)
    }

    /// Give the live incident `id` its tracker key unless it already has one.
    pub fn set_tracker_key(&mut self, id: i64, key: &str) -> bool {
        match self.incidents.values_mut().find(|m| m.data().id == id) {
            Some(live) if live.data().tracker_key.is_none() => {
                live.data_mut().tracker_key = Some(key.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn rooms(&self) -> Vec<String> {
        self.incidents.keys().cloned().collect()
    }

    /// Owned copies of every live incident, for work done outside the lock.
    pub fn snapshot(&self) -> Vec<IncidentMachine> {
        self.incidents.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }
}

impl FromIterator<IncidentMachine> for IncidentRegistry {
    fn from_iter<I: IntoIterator<Item = IncidentMachine>>(iter: I) -> Self {
        let incidents = iter
            .into_iter()
            .map(|m| (m.data().chat_room.clone(), m))
            .collect();
        Self { incidents }
    }
}
