//! # Breakbot Commands
//!
//! The mutation API chat handlers call. Every operation writes to the
//! [`IncidentStore`](breakbot_db::IncidentStore) first and only then reflects
//! the change into the shared registry, so a failed write leaves memory untouched.

pub mod commands;
pub mod gate;

pub use commands::{ComponentChanges, IncidentCommands};
pub use gate::Gate;
