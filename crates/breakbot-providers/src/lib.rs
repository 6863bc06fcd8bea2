//! # Breakbot Providers
//!
//! Issue tracker and report platform implementations, selected by config tag:
//! `[tracker] platform = "jira" | "none"` and `[report] platform = "markdown" | "none"`.

pub mod jira;
pub mod markdown;

use std::sync::Arc;

use breakbot_core::config::{ReportConfig, TrackerConfig};
use breakbot_core::error::{BreakbotError, Result};
use breakbot_core::traits::{IssueTracker, ReportPlatform};

pub use jira::JiraTracker;
pub use markdown::MarkdownReport;

/// Create the issue tracker from configuration. `None` when disabled.
pub fn create_tracker(config: &TrackerConfig) -> Result<Option<Arc<dyn IssueTracker>>> {
    match config.platform.as_str() {
        "none" | "" => Ok(None),
        "jira" => {
            let missing: Vec<&str> = [
                ("base_url", &config.base_url),
                ("user", &config.user),
                ("api_token", &config.api_token),
                ("project", &config.project),
            ]
            .into_iter()
            .filter(|(_, v)| v.is_empty())
            .map(|(k, _)| k)
            .collect();
            if !missing.is_empty() {
                return Err(BreakbotError::Config(format!(
                    "tracker.{} required for Jira",
                    missing.join(", tracker.")
                )));
            }
            Ok(Some(Arc::new(JiraTracker::new(config))))
        }
        other => Err(BreakbotError::Config(format!("Unknown tracker platform: {other}"))),
    }
}

/// Create the report platform from configuration. `None` when disabled.
pub fn create_reporter(config: &ReportConfig) -> Result<Option<Arc<dyn ReportPlatform>>> {
    match config.platform.as_str() {
        "none" | "" => Ok(None),
        "markdown" => Ok(Some(Arc::new(MarkdownReport::new(config.resolved_dir())))),
        other => Err(BreakbotError::Config(format!("Unknown report platform: {other}"))),
    }
}

/// List all available platform tags.
pub fn available_platforms() -> Vec<&'static str> {
    vec!["jira", "markdown", "none"]
}
