//! Error type shared by every Breakbot crate.

use crate::incident::IncidentState;

/// All failures surfaced by the Breakbot libraries.
#[derive(Debug, thiserror::Error)]
pub enum BreakbotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("Report platform error: {0}")]
    Report(String),

    #[error("Chat error: {0}")]
    Chat(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: IncidentState,
        to: IncidentState,
    },

    #[error("Invalid priority: {0}")]
    InvalidPriority(i64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Incident in {0} is no longer active")]
    NotActive(String),

    #[error("Incident in {0} can no longer be updated")]
    NotUpdatable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, BreakbotError>;
