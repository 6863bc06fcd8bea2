//! Markdown report platform: writes a retrospective draft to disk.

use std::path::PathBuf;

use async_trait::async_trait;
use breakbot_core::error::{BreakbotError, Result};
use breakbot_core::traits::ReportPlatform;
use breakbot_core::types::{Incident, LogEntry, LogType, Role};
use chrono::{DateTime, Utc};

/// Drafts `incident-<id>.md` files under a directory.
pub struct MarkdownReport {
    dir: PathBuf,
}

fn ts(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Render the draft body.
pub fn render(incident: &Incident, logs: &[LogEntry], drafted_by: &str) -> String {
    let mut out = format!("# Incident #{}: {}\n\n", incident.id, incident.title);
    out.push_str(&format!("- **Priority:** P{}\n", incident.priority));
    out.push_str(&format!("- **Declared by:** {} at {}\n", incident.created_by, ts(incident.created_at)));
    out.push_str(&format!("- **Drafted by:** {drafted_by}\n"));
    if let Some(key) = &incident.tracker_key {
        out.push_str(&format!("- **Tracker:** {key}\n"));
    }

    out.push_str("\n## Summary\n\n");
    out.push_str(incident.summary.as_deref().unwrap_or("_No summary yet._"));
    out.push('\n');

    out.push_str("\n## Roles\n\n");
    for role in [Role::Point, Role::Comms, Role::Triage, Role::Eng, Role::Assigned] {
        out.push_str(&format!("- **{role}:** {}\n", incident.role(role).unwrap_or("unassigned")));
    }

    let milestones = [
        ("Genesis", incident.genesis_at),
        ("Detected", incident.detected_at),
        ("Acknowledged", incident.acknowledged_at),
        ("Mitigated", incident.mitigated_at),
        ("Resolved", incident.resolved_at),
        ("Ready for review", incident.ready_for_review_at),
        ("Completed", incident.completed_at),
    ];
    out.push_str("\n## Milestones\n\n");
    for (name, at) in milestones.into_iter().filter_map(|(n, at)| at.map(|at| (n, at))) {
        out.push_str(&format!("- **{name}:** {}\n", ts(at)));
    }

    if !incident.affected.is_empty() || !incident.components.is_empty() {
        out.push_str("\n## Impact\n\n");
        if !incident.affected.is_empty() {
            out.push_str(&format!("- **Affected:** {}\n", incident.affected.join(", ")));
        }
        if !incident.components.is_empty() {
            out.push_str(&format!("- **Components:** {}\n", incident.components.join(", ")));
        }
    }

    let factors: Vec<&LogEntry> = logs.iter().filter(|l| l.kind == LogType::ContributingFactor).collect();
    if !factors.is_empty() {
        out.push_str("\n## Contributing factors\n\n");
        for f in factors {
            out.push_str(&format!("- {}\n", f.text));
        }
    }

    let actions: Vec<&LogEntry> = logs.iter().filter(|l| l.kind == LogType::ActionItem).collect();
    if !actions.is_empty() {
        out.push_str("\n## Action items\n\n");
        for a in actions {
            match &a.context_url {
                Some(url) => out.push_str(&format!("- [{}]({url})\n", a.text)),
                None => out.push_str(&format!("- {}\n", a.text)),
            }
        }
    }

    out.push_str("\n## Timeline\n\n| Time | Type | By | Entry |\n|---|---|---|---|\n");
    for entry in logs {
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            ts(entry.created_at),
            entry.kind.label(),
            entry.created_by,
            entry.text.replace('|', "\\|").replace('\n', " ")
        ));
    }
    out
}

impl MarkdownReport {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, incident: &Incident) -> PathBuf {
        self.dir.join(format!("incident-{}.md", incident.id))
    }
}

#[async_trait]
impl ReportPlatform for MarkdownReport {
    fn name(&self) -> &str {
        "markdown"
    }

    async fn init(&self) -> bool {
        match tokio::fs::create_dir_all(&self.dir).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("❌ Cannot create report directory {}: {e}", self.dir.display());
                false
            }
        }
    }

    async fn draft(&self, incident: &Incident, logs: &[LogEntry], drafted_by: &str) -> Result<String> {
        let path = self.path_for(incident);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| BreakbotError::Report(format!("Create {}: {e}", self.dir.display())))?;
        tokio::fs::write(&path, render(incident, logs, drafted_by))
            .await
            .map_err(|e| BreakbotError::Report(format!("Write {}: {e}", path.display())))?;
        Ok(path.display().to_string())
    }

    async fn resolve_user_id(&self, _email: &str, _chat_user_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}
