//! Breakbot configuration system.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{BreakbotError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakbotConfig {
    #[serde(default = "default_priority")]
    pub default_priority: i64,
    #[serde(default = "default_priorities")]
    pub priorities: Vec<PriorityConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub engines: EngineConfig,
}

fn default_priority() -> i64 { 3 }

impl Default for BreakbotConfig {
    fn default() -> Self {
        Self {
            default_priority: default_priority(),
            priorities: default_priorities(),
            database: DatabaseConfig::default(),
            chat: ChatConfig::default(),
            tracker: TrackerConfig::default(),
            report: ReportConfig::default(),
            engines: EngineConfig::default(),
        }
    }
}

impl BreakbotConfig {
    /// Load config from the default path (~/.breakbot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BreakbotError::Config(format!("Failed to read config {}: {e}", path.display())))?;
        let mut config = Self::parse(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the environment.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Secrets may come from the environment instead of the file.
    pub fn apply_env(&mut self) {
        if let Some(token) = std::env::var("BREAKBOT_CHAT_TOKEN").ok().filter(|t| !t.is_empty()) {
            self.chat.bot_token = token;
        }
        if let Some(token) = std::env::var("BREAKBOT_TRACKER_TOKEN").ok().filter(|t| !t.is_empty()) {
            self.tracker.api_token = token;
        }
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.priorities.is_empty() {
            return Err(BreakbotError::Config("priority table is empty".into()));
        }
        if self.priority(self.default_priority).is_none() {
            return Err(BreakbotError::Config(format!(
                "default priority {} is not in the priority table",
                self.default_priority
            )));
        }
        if self.engines.tick_secs == 0 {
            return Err(BreakbotError::Config("engines.tick_secs must be > 0".into()));
        }
        if self.engines.syntrax && self.tracker.platform == "none" {
            return Err(BreakbotError::Config(
                "engines.syntrax is enabled but no issue tracker is configured".into(),
            ));
        }
        Ok(())
    }

    /// Look up a configured priority.
    pub fn priority(&self, priority: i64) -> Option<&PriorityConfig> {
        self.priorities.iter().find(|p| p.priority == priority)
    }

    /// Like [`priority`](Self::priority) but fails for unknown values.
    pub fn validate_priority(&self, priority: i64) -> Result<&PriorityConfig> {
        self.priority(priority)
            .ok_or(BreakbotError::InvalidPriority(priority))
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Breakbot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".breakbot")
    }
}

/// One row of the priority table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriorityConfig {
    pub priority: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub high_priority: bool,
    #[serde(default)]
    pub report_required: bool,
    #[serde(default)]
    pub review_required: bool,
    #[serde(default)]
    pub nag: NagThresholds,
}

/// The stall conditions the escalation engine nags about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NagKind {
    NoComms,
    NoPoint,
    NeedsCommUpdate,
    NeedsInitialComm,
}

impl NagKind {
    pub const ALL: [NagKind; 4] = [
        NagKind::NoComms,
        NagKind::NoPoint,
        NagKind::NeedsCommUpdate,
        NagKind::NeedsInitialComm,
    ];
}

impl fmt::Display for NagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NagKind::NoComms => write!(f, "no_comms"),
            NagKind::NoPoint => write!(f, "no_point"),
            NagKind::NeedsCommUpdate => write!(f, "needs_comm_update"),
            NagKind::NeedsInitialComm => write!(f, "needs_initial_comm"),
        }
    }
}

/// Per-priority escalation thresholds, in seconds. Unset means never nag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NagThresholds {
    pub no_comms: Option<u64>,
    pub no_point: Option<u64>,
    pub needs_comm_update: Option<u64>,
    pub needs_initial_comm: Option<u64>,
}

impl NagThresholds {
    pub fn get(&self, kind: NagKind) -> Option<u64> {
        match kind {
            NagKind::NoComms => self.no_comms,
            NagKind::NoPoint => self.no_point,
            NagKind::NeedsCommUpdate => self.needs_comm_update,
            NagKind::NeedsInitialComm => self.needs_initial_comm,
        }
    }
}

fn default_priorities() -> Vec<PriorityConfig> {
    vec![
        PriorityConfig {
            priority: 1,
            name: "P1".into(),
            description: "Critical: widespread customer impact".into(),
            high_priority: true,
            report_required: true,
            review_required: true,
            nag: NagThresholds {
                no_comms: Some(15 * 60),
                no_point: Some(5 * 60),
                needs_comm_update: Some(30 * 60),
                needs_initial_comm: Some(15 * 60),
            },
        },
        PriorityConfig {
            priority: 2,
            name: "P2".into(),
            description: "Major: significant impact on a subset of customers".into(),
            high_priority: true,
            report_required: true,
            review_required: true,
            nag: NagThresholds {
                no_comms: Some(30 * 60),
                no_point: Some(15 * 60),
                needs_comm_update: Some(60 * 60),
                needs_initial_comm: Some(30 * 60),
            },
        },
        PriorityConfig {
            priority: 3,
            name: "P3".into(),
            description: "Minor: limited impact, workaround available".into(),
            high_priority: false,
            report_required: false,
            review_required: false,
            nag: NagThresholds {
                no_comms: Some(4 * 60 * 60),
                ..Default::default()
            },
        },
        PriorityConfig {
            priority: 4,
            name: "P4".into(),
            description: "Low: cosmetic or internal only".into(),
            high_priority: false,
            report_required: false,
            review_required: false,
            nag: NagThresholds::default(),
        },
    ]
}

/// Durable storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.breakbot/breakbot.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Chat platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_platform")]
    pub platform: String,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_slack_api")]
    pub api_base: String,
}

fn default_chat_platform() -> String { "slack".into() }
fn default_slack_api() -> String { "https://slack.com/api".into() }

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            platform: default_chat_platform(),
            bot_token: String::new(),
            api_base: default_slack_api(),
        }
    }
}

/// Issue tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// "jira" or "none".
    #[serde(default = "default_none")]
    pub platform: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub project: String,
    #[serde(default = "default_issue_type")]
    pub issue_type: String,
}

fn default_none() -> String { "none".into() }
fn default_issue_type() -> String { "Task".into() }

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            platform: default_none(),
            base_url: String::new(),
            user: String::new(),
            api_token: String::new(),
            project: String::new(),
            issue_type: default_issue_type(),
        }
    }
}

/// Report platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// "markdown" or "none".
    #[serde(default = "default_report_platform")]
    pub platform: String,
    /// Where markdown drafts are written.
    #[serde(default = "default_report_dir")]
    pub dir: String,
}

fn default_report_platform() -> String { "markdown".into() }
fn default_report_dir() -> String { "~/.breakbot/reports".into() }

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            platform: default_report_platform(),
            dir: default_report_dir(),
        }
    }
}

impl ReportConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.dir).to_string())
    }
}

/// Background engine cadence and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Upper bound of the random delay before each tracker sync call.
    #[serde(default = "default_sync_jitter_secs")]
    pub sync_jitter_secs: u64,
    /// How long a completed incident lingers before archival.
    #[serde(default = "default_archive_after_secs")]
    pub archive_after_secs: u64,
    /// Tracker sync. Off by default since the default tracker is `none`.
    #[serde(default)]
    pub syntrax: bool,
    #[serde(default = "bool_true")]
    pub annoyotron: bool,
    #[serde(default = "bool_true")]
    pub archivist: bool,
}

fn bool_true() -> bool { true }
fn default_tick_secs() -> u64 { 64 }
fn default_sync_jitter_secs() -> u64 { 60 }
fn default_archive_after_secs() -> u64 { 14 * 24 * 60 * 60 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            sync_jitter_secs: default_sync_jitter_secs(),
            archive_after_secs: default_archive_after_secs(),
            syntrax: false,
            annoyotron: true,
            archivist: true,
        }
    }
}
