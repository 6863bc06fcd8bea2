//! # Breakbot Core
//!
//! Shared building blocks for the breaking (outage) process bot:
//! configuration, the incident data model, collaborator traits, the
//! incident state machine and the in-memory incident registry.
//!
//! ## Architecture
//! ```text
//! chat command ──► breakbot-commands ──► IncidentStore (write)
//!                          │                    │
//!                          └──► IncidentRegistry ◄── engines (breakbot-scheduler)
//!                                 room → IncidentMachine
//! ```

pub mod config;
pub mod error;
pub mod incident;
pub mod registry;
pub mod traits;
pub mod types;

pub use config::{BreakbotConfig, NagKind, NagThresholds, PriorityConfig};
pub use error::{BreakbotError, Result};
pub use incident::{IncidentMachine, IncidentState, is_active, is_updatable};
pub use registry::{IncidentRegistry, SharedRegistry};
pub use traits::{ChatAdapter, IssueTracker, ReportPlatform};
pub use types::{Blocker, ChatUser, Incident, LogEntry, LogType, Role, UserCacheEntry};
