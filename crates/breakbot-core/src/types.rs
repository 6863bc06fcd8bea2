//! Incident data model: the rows the store persists and the registry holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BreakbotError;

/// One breaking event, with its associated collections loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Storage-assigned numeric id (0 until first insert).
    pub id: i64,
    /// Chat room the incident is run from. Unique among non-archived incidents.
    pub chat_room: String,
    /// Issue key in the external tracker, once one exists.
    pub tracker_key: Option<String>,
    pub priority: i64,
    pub title: String,
    pub summary: Option<String>,

    pub point: Option<String>,
    pub comms: Option<String>,
    pub triage: Option<String>,
    pub eng_lead: Option<String>,
    pub assigned: Option<String>,

    pub genesis_at: Option<DateTime<Utc>>,
    pub detected_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub mitigated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub ready_for_review_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,

    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub affected: Vec<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<Blocker>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl Incident {
    /// A freshly declared incident, not yet stored.
    pub fn new(chat_room: &str, title: &str, priority: i64, created_by: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            chat_room: chat_room.to_string(),
            tracker_key: None,
            priority,
            title: title.to_string(),
            summary: None,
            point: None,
            comms: None,
            triage: None,
            eng_lead: None,
            assigned: None,
            genesis_at: None,
            detected_at: None,
            acknowledged_at: None,
            mitigated_at: None,
            resolved_at: None,
            ready_for_review_at: None,
            completed_at: None,
            archived_at: None,
            canceled_at: None,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            affected: Vec::new(),
            components: Vec::new(),
            blockers: Vec::new(),
            logs: Vec::new(),
        }
    }

    /// Blockers that have not been cleared.
    pub fn active_blockers(&self) -> impl Iterator<Item = &Blocker> {
        self.blockers.iter().filter(|b| b.is_active())
    }

    pub fn is_blocked(&self) -> bool {
        self.active_blockers().next().is_some()
    }

    /// Most recent log entry of the given kind.
    pub fn last_log_of(&self, kind: LogType) -> Option<&LogEntry> {
        self.logs
            .iter()
            .filter(|l| l.kind == kind)
            .max_by_key(|l| l.created_at)
    }

    /// Timestamp of the latest log entry of any kind.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.logs.iter().map(|l| l.created_at).max()
    }

    pub fn role(&self, role: Role) -> Option<&str> {
        match role {
            Role::Point => self.point.as_deref(),
            Role::Comms => self.comms.as_deref(),
            Role::Triage => self.triage.as_deref(),
            Role::Eng => self.eng_lead.as_deref(),
            Role::Assigned => self.assigned.as_deref(),
        }
    }

    pub fn set_role(&mut self, role: Role, who: Option<String>) {
        let slot = match role {
            Role::Point => &mut self.point,
            Role::Comms => &mut self.comms,
            Role::Triage => &mut self.triage,
            Role::Eng => &mut self.eng_lead,
            Role::Assigned => &mut self.assigned,
        };
        *slot = who;
    }
}

/// Role assignments an incident carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Point,
    Comms,
    Triage,
    Eng,
    Assigned,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Point => write!(f, "point"),
            Role::Comms => write!(f, "comms"),
            Role::Triage => write!(f, "triage"),
            Role::Eng => write!(f, "eng"),
            Role::Assigned => write!(f, "assigned"),
        }
    }
}

/// Something (or someone) blocking progress on an incident.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Blocker {
    pub id: i64,
    pub incident_id: i64,
    pub whomst: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub unblocked_at: Option<DateTime<Utc>>,
}

impl Blocker {
    pub fn is_active(&self) -> bool {
        self.unblocked_at.is_none()
    }
}

/// Category tag of an incident log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    ActionItem,
    Affected,
    Blocker,
    CommUpdate,
    Component,
    ContributingFactor,
    Event,
    Note,
    Pr,
    Priority,
    Summary,
    Unblock,
}

impl LogType {
    pub const ALL: [LogType; 12] = [
        LogType::ActionItem,
        LogType::Affected,
        LogType::Blocker,
        LogType::CommUpdate,
        LogType::Component,
        LogType::ContributingFactor,
        LogType::Event,
        LogType::Note,
        LogType::Pr,
        LogType::Priority,
        LogType::Summary,
        LogType::Unblock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::ActionItem => "action_item",
            LogType::Affected => "affected",
            LogType::Blocker => "blocker",
            LogType::CommUpdate => "comm_update",
            LogType::Component => "component",
            LogType::ContributingFactor => "contributing_factor",
            LogType::Event => "event",
            LogType::Note => "note",
            LogType::Pr => "pr",
            LogType::Priority => "priority",
            LogType::Summary => "summary",
            LogType::Unblock => "unblock",
        }
    }

    /// Label used when rendering timelines for humans.
    pub fn label(&self) -> &'static str {
        match self {
            LogType::ActionItem => "Action item",
            LogType::Affected => "Affected",
            LogType::Blocker => "Blocker",
            LogType::CommUpdate => "Comm update",
            LogType::Component => "Component",
            LogType::ContributingFactor => "Contributing factor",
            LogType::Event => "Event",
            LogType::Note => "Note",
            LogType::Pr => "PR",
            LogType::Priority => "Priority",
            LogType::Summary => "Summary",
            LogType::Unblock => "Unblock",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogType {
    type Err = BreakbotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| BreakbotError::Storage(format!("unknown log type '{s}'")))
    }
}

/// Immutable, append-only activity record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: i64,
    pub incident_id: i64,
    pub kind: LogType,
    pub text: String,
    pub context_url: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Cached identity resolution for a chat user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserCacheEntry {
    pub chat_user_id: String,
    pub tracker_user_id: Option<String>,
    pub report_user_id: Option<String>,
    pub name: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A chat user as the chat platform describes them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatUser {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}
