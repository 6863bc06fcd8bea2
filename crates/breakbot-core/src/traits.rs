//! Collaborator contracts. One implementation per platform is selected from
//! configuration at startup and held for the life of the process.

use async_trait::async_trait;

use crate::error::Result;
use crate::incident::IncidentState;
use crate::types::{ChatUser, Incident, LogEntry};

/// The chat platform the breaking process runs in.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Verify credentials. `false` is fatal at startup.
    async fn init(&self) -> bool;

    /// Post a message to a room. Returns the platform message id.
    async fn send(&self, room: &str, text: &str) -> Result<String>;

    /// Reply in the thread of an existing message.
    async fn reply(&self, room: &str, message_id: &str, text: &str) -> Result<String>;

    async fn react(&self, room: &str, message_id: &str, emoji: &str) -> Result<()>;

    async fn permalink(&self, room: &str, message_id: &str) -> Result<Option<String>>;

    async fn join(&self, room: &str) -> Result<()>;

    async fn leave(&self, room: &str) -> Result<()>;

    /// Rooms the bot is already a member of.
    async fn joined_rooms(&self) -> Result<Vec<String>>;

    async fn resolve_user(&self, user_id: &str) -> Result<Option<ChatUser>>;
}

/// The external issue tracker incidents are mirrored into.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self) -> bool;

    /// Push the incident's current data, state and new log entries.
    /// Returns the tracker's key for the incident, when it has one.
    async fn sync(
        &self,
        incident: &Incident,
        state: IncidentState,
        logs: &[LogEntry],
    ) -> Result<Option<String>>;

    /// Push the incident's components. Returns the key like [`sync`](Self::sync).
    async fn sync_components(&self, incident: &Incident) -> Result<Option<String>>;

    /// Create a follow-up item. Returns `(key, url)` when the tracker made one.
    async fn new_action_item(
        &self,
        incident: &Incident,
        text: &str,
        author: &str,
        context_url: Option<&str>,
    ) -> Result<Option<(String, String)>>;

    /// Filter `names` down to components the tracker knows about.
    async fn valid_component_names(&self, names: &[String]) -> Result<Vec<String>>;

    async fn resolve_user_id(&self, email: &str, chat_user_id: &str) -> Result<Option<String>>;
}

/// Where post-incident reports are drafted.
#[async_trait]
pub trait ReportPlatform: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self) -> bool;

    async fn draft(&self, incident: &Incident, logs: &[LogEntry], drafted_by: &str) -> Result<String>;

    async fn resolve_user_id(&self, email: &str, chat_user_id: &str) -> Result<Option<String>>;
}
