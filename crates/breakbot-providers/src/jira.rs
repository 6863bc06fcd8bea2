//! Jira tracker: REST API v2 with basic auth (user + API token).
//!
//! Every incident maps to one issue. Syncs return the issue key and callers
//! store it on the incident. Until that happens the issue is found by its
//! `breakbot-<id>` label, and created if missing.

use async_trait::async_trait;
use breakbot_core::config::TrackerConfig;
use breakbot_core::error::{BreakbotError, Result};
use breakbot_core::incident::IncidentState;
use breakbot_core::traits::IssueTracker;
use breakbot_core::types::{Incident, LogEntry};
use serde_json::{Value, json};

/// Jira Cloud / Server client.
pub struct JiraTracker {
    client: reqwest::Client,
    base_url: String,
    user: String,
    api_token: String,
    project: String,
    issue_type: String,
}

/// Label tying an issue to its incident.
pub fn incident_label(incident: &Incident) -> String {
    format!("breakbot-{}", incident.id)
}

/// Label carrying the lifecycle state, e.g. `state-ready_for_review`.
pub fn state_label(state: IncidentState) -> String {
    let mut label = String::from("state-");
    for (i, ch) in state.to_string().chars().enumerate() {
        if ch.is_ascii_uppercase() && i > 0 {
            label.push('_');
        }
        label.push(ch.to_ascii_lowercase());
    }
    label
}

/// Fields written on every sync.
pub fn issue_fields(incident: &Incident, state: IncidentState) -> Value {
    let mut labels = vec![
        "breakbot".to_string(),
        incident_label(incident),
        format!("priority-p{}", incident.priority),
        state_label(state),
    ];
    if incident.is_blocked() {
        labels.push("blocked".into());
    }

    let mut description = incident.summary.clone().unwrap_or_default();
    let roles = [
        ("Point", &incident.point),
        ("Comms", &incident.comms),
        ("Triage", &incident.triage),
        ("Eng lead", &incident.eng_lead),
    ];
    for (role, who) in roles {
        if let Some(who) = who {
            description.push_str(&format!("\n*{role}:* {who}"));
        }
    }
    if !incident.affected.is_empty() {
        description.push_str(&format!("\n*Affected:* {}", incident.affected.join(", ")));
    }

    json!({
        "summary": format!("[P{}] {}", incident.priority, incident.title),
        "labels": labels,
        "description": description.trim_start(),
    })
}

/// One comment carrying every new log entry, oldest first.
pub fn render_comment(logs: &[LogEntry]) -> String {
    logs.iter()
        .map(|entry| {
            let mut line = format!(
                "*{}* ({} at {}): {}",
                entry.kind.label(),
                entry.created_by,
                entry.created_at.format("%Y-%m-%d %H:%M UTC"),
                entry.text
            );
            if let Some(url) = &entry.context_url {
                line.push_str(&format!(" [context|{url}]"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keep the requested names Jira knows, in Jira's spelling.
pub fn match_components(requested: &[String], known: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter_map(|name| known.iter().find(|k| k.eq_ignore_ascii_case(name)).cloned())
        .collect()
}

impl JiraTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            api_token: config.api_token.clone(),
            project: config.project.clone(),
            issue_type: config.issue_type.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/api/2/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn browse_url(&self, key: &str) -> String {
        format!("{}/browse/{}", self.base_url, key)
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        let mut req = self
            .client
            .request(method.clone(), self.url(path))
            .basic_auth(&self.user, Some(&self.api_token));
        if let Some(body) = &body {
            req = req.json(body);
        }
        let response = req
            .send()
            .await
            .map_err(|e| BreakbotError::Tracker(format!("Jira {method} {path} failed: {e}")))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(BreakbotError::Tracker(format!(
                "Jira {method} {path} returned {status}: {}",
                text.chars().take(300).collect::<String>()
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| BreakbotError::Tracker(format!("Invalid Jira response for {path}: {e}")))
    }

    async fn find_issue(&self, incident: &Incident) -> Result<Option<String>> {
        let jql = format!(
            "project = \"{}\" AND labels = \"{}\"",
            self.project,
            incident_label(incident)
        );
        let body = self
            .request(
                reqwest::Method::POST,
                "search",
                Some(json!({ "jql": jql, "fields": ["key"], "maxResults": 1 })),
            )
            .await?;
        Ok(body
            .get("issues")
            .and_then(Value::as_array)
            .and_then(|issues| issues.first())
            .and_then(|issue| issue.get("key"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn create_issue(&self, mut fields: Value) -> Result<String> {
        if let Some(obj) = fields.as_object_mut() {
            obj.insert("project".into(), json!({ "key": self.project }));
            obj.insert("issuetype".into(), json!({ "name": self.issue_type }));
        }
        let body = self
            .request(reqwest::Method::POST, "issue", Some(json!({ "fields": fields })))
            .await?;
        body.get("key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BreakbotError::Tracker("Jira created an issue without a key".into()))
    }

    /// Issue key for the incident, creating the issue on first sync.
    async fn issue_key(&self, incident: &Incident, state: IncidentState) -> Result<String> {
        if let Some(key) = &incident.tracker_key {
            return Ok(key.clone());
        }
        if let Some(key) = self.find_issue(incident).await? {
            return Ok(key);
        }
        let key = self.create_issue(issue_fields(incident, state)).await?;
        tracing::info!("🎫 Created Jira issue {} for incident #{}", key, incident.id);
        Ok(key)
    }
}

#[async_trait]
impl IssueTracker for JiraTracker {
    fn name(&self) -> &str {
        "jira"
    }

    async fn init(&self) -> bool {
        match self.request(reqwest::Method::GET, "myself", None).await {
            Ok(me) => {
                tracing::info!(
                    "🎫 Jira connected as {}",
                    me.get("displayName").and_then(serde_json::Value::as_str).unwrap_or("unknown")
                );
                true
            }
            Err(e) => {
                tracing::error!("❌ Jira auth failed: {e}");
                false
            }
        }
    }

    async fn sync(
        &self,
        incident: &Incident,
        state: IncidentState,
        logs: &[LogEntry],
    ) -> Result<Option<String>> {
        let key = self.issue_key(incident, state).await?;
        self.request(
            reqwest::Method::PUT,
            &format!("issue/{key}"),
            Some(json!({ "fields": issue_fields(incident, state) })),
        )
        .await?;

        if !logs.is_empty() {
            self.request(
                reqwest::Method::POST,
                &format!("issue/{key}/comment"),
                Some(json!({ "body": render_comment(logs) })),
            )
            .await?;
        }
        tracing::debug!("Synced incident #{} to {} ({} entries)", incident.id, key, logs.len());
        Ok(Some(key))
    }

    async fn sync_components(&self, incident: &Incident) -> Result<Option<String>> {
        let key = self.issue_key(incident, IncidentState::Started).await?;
        let components: Vec<Value> = incident
            .components
            .iter()
            .map(|name| json!({ "name": name }))
            .collect();
        self.request(
            reqwest::Method::PUT,
            &format!("issue/{key}"),
            Some(json!({ "fields": { "components": components } })),
        )
        .await?;
        Ok(Some(key))
    }

    async fn new_action_item(
        &self,
        incident: &Incident,
        text: &str,
        author: &str,
        context_url: Option<&str>,
    ) -> Result<Option<(String, String)>> {
        let mut description = format!(
            "Action item from incident #{}: {}\nRaised by {}",
            incident.id, incident.title, author
        );
        if let Some(url) = context_url {
            description.push_str(&format!("\nContext: {url}"));
        }
        let fields = json!({
            "summary": text,
            "description": description,
            "labels": ["breakbot-action-item", incident_label(incident)],
        });
        let key = self.create_issue(fields).await?;
        let url = self.browse_url(&key);
        Ok(Some((key, url)))
    }

    async fn valid_component_names(&self, names: &[String]) -> Result<Vec<String>> {
        let body = self
            .request(
                reqwest::Method::GET,
                &format!("project/{}/components", self.project),
                None,
            )
            .await?;
        let known: Vec<String> = body
            .as_array()
            .map(|components| {
                components
                    .iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(match_components(names, &known))
    }

    async fn resolve_user_id(&self, email: &str, _chat_user_id: &str) -> Result<Option<String>> {
        let body = self
            .request(
                reqwest::Method::GET,
                &format!("user/search?query={}", email.replace('+', "%2B")),
                None,
            )
            .await?;
        Ok(body
            .as_array()
            .and_then(|users| users.first())
            .and_then(|u| u.get("accountId"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breakbot_core::types::LogType;
    use chrono::{TimeZone, Utc};

    fn incident() -> Incident {
        let mut inc = Incident::new("C1", "Checkout 500s", 1, "alice");
        inc.id = 42;
        inc.point = Some("bob".into());
        inc.affected = vec!["web".into(), "ios".into()];
        inc
    }

    #[test]
    fn test_state_label() {
        assert_eq!(state_label(IncidentState::ReadyForReview), "state-ready_for_review");
        assert_eq!(state_label(IncidentState::Started), "state-started");
    }

    #[test]
    fn test_issue_fields() {
        let fields = issue_fields(&incident(), IncidentState::Acknowledged);
        assert_eq!(fields["summary"], "[P1] Checkout 500s");
        let labels: Vec<&str> = fields["labels"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l.as_str().unwrap())
            .collect();
        assert_eq!(labels, vec!["breakbot", "breakbot-42", "priority-p1", "state-acknowledged"]);
        let description = fields["description"].as_str().unwrap();
        assert!(description.starts_with("*Point:* bob"));
        assert!(description.contains("*Affected:* web, ios"));
    }

    #[test]
    fn test_render_comment() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let logs = vec![
            LogEntry {
                id: 1,
                incident_id: 42,
                kind: LogType::CommUpdate,
                text: "Investigating".into(),
                context_url: None,
                created_by: "alice".into(),
                created_at: at,
            },
            LogEntry {
                id: 2,
                incident_id: 42,
                kind: LogType::Pr,
                text: "Revert deploy".into(),
                context_url: Some("https://git.example/pr/7".into()),
                created_by: "bob".into(),
                created_at: at,
            },
        ];
        assert_eq!(
            render_comment(&logs),
            "*Comm update* (alice at 2024-03-01 12:30 UTC): Investigating\n\
             *PR* (bob at 2024-03-01 12:30 UTC): Revert deploy [context|https://git.example/pr/7]"
        );
    }

    #[test]
    fn test_match_components_uses_jira_spelling() {
        let known = vec!["API".to_string(), "Database".to_string()];
        let requested = vec!["api".to_string(), "cdn".to_string()];
        assert_eq!(match_components(&requested, &known), vec!["API".to_string()]);
    }

    #[test]
    fn test_urls() {
        let jira = JiraTracker::new(&TrackerConfig {
            platform: "jira".into(),
            base_url: "https://acme.atlassian.net/".into(),
            ..Default::default()
        });
        assert_eq!(jira.url("/myself"), "https://acme.atlassian.net/rest/api/2/myself");
        assert_eq!(jira.browse_url("OPS-1"), "https://acme.atlassian.net/browse/OPS-1");
    }

    #[tokio::test]
    async fn test_known_issue_key_skips_lookup() {
        // Nothing listens here; any request would fail.
        let jira = JiraTracker::new(&TrackerConfig {
            platform: "jira".into(),
            base_url: "http://127.0.0.1:9".into(),
            ..Default::default()
        });
        let mut inc = incident();
        inc.tracker_key = Some("OPS-7".into());
        let key = jira.issue_key(&inc, IncidentState::Started).await.unwrap();
        assert_eq!(key, "OPS-7");
    }
}
