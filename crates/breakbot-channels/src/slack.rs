//! Slack adapter: Web API calls with a bot token.

use async_trait::async_trait;
use breakbot_core::error::{BreakbotError, Result};
use breakbot_core::traits::ChatAdapter;
use breakbot_core::types::ChatUser;
use serde::Deserialize;
use serde_json::{Map, Value, json};

/// Slack Web API client.
pub struct SlackAdapter {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

/// Every Web API response carries `ok` and, on failure, an `error` code.
#[derive(Debug, Deserialize)]
pub struct SlackResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl SlackResponse {
    fn into_result(self, method: &str) -> Result<Map<String, Value>> {
        if self.ok {
            Ok(self.body)
        } else {
            Err(BreakbotError::Chat(format!(
                "Slack {method} failed: {}",
                self.error.unwrap_or_else(|| "unknown_error".into())
            )))
        }
    }

    fn error_is(&self, code: &str) -> bool {
        !self.ok && self.error.as_deref() == Some(code)
    }
}

/// `:tada:` and `tada` both name the same reaction.
pub fn emoji_name(emoji: &str) -> &str {
    emoji.trim_matches(':')
}

/// Extract a [`ChatUser`] from a `users.info` body.
pub fn parse_user(body: &Map<String, Value>) -> Option<ChatUser> {
    let user = body.get("user")?;
    let id = user.get("id")?.as_str()?.to_string();
    let profile = user.get("profile");
    let name = profile
        .and_then(|p| p.get("real_name"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .or_else(|| user.get("name").and_then(Value::as_str))
        .unwrap_or(id.as_str())
        .to_string();
    let email = profile
        .and_then(|p| p.get("email"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(ChatUser { id, name, email })
}

fn str_field(body: &Map<String, Value>, key: &str) -> Option<String> {
    body.get(key).and_then(Value::as_str).map(str::to_string)
}

impl SlackAdapter {
    pub fn new(api_base: &str, bot_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    async fn post(&self, method: &str, body: Value) -> Result<SlackResponse> {
        let response = self
            .client
            .post(self.api_url(method))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BreakbotError::Chat(format!("Slack {method} request failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| BreakbotError::Chat(format!("Invalid Slack {method} response: {e}")))
    }

    async fn get(&self, method: &str, query: &[(&str, &str)]) -> Result<SlackResponse> {
        let response = self
            .client
            .get(self.api_url(method))
            .bearer_auth(&self.bot_token)
            .query(query)
            .send()
            .await
            .map_err(|e| BreakbotError::Chat(format!("Slack {method} request failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| BreakbotError::Chat(format!("Invalid Slack {method} response: {e}")))
    }

    async fn post_message(&self, body: Value) -> Result<String> {
        let body = self.post("chat.postMessage", body).await?.into_result("chat.postMessage")?;
        str_field(&body, "ts")
            .ok_or_else(|| BreakbotError::Chat("chat.postMessage returned no ts".into()))
    }
}

#[async_trait]
impl ChatAdapter for SlackAdapter {
    fn name(&self) -> &str {
        "slack"
    }

    async fn init(&self) -> bool {
        match self.post("auth.test", json!({})).await.and_then(|r| r.into_result("auth.test")) {
            Ok(body) => {
                tracing::info!(
                    "💬 Slack connected as {} ({})",
                    str_field(&body, "user").unwrap_or_else(|| "unknown".into()),
                    str_field(&body, "team").unwrap_or_default()
                );
                true
            }
            Err(e) => {
                tracing::error!("❌ Slack auth failed: {e}");
                false
            }
        }
    }

    async fn send(&self, room: &str, text: &str) -> Result<String> {
        self.post_message(json!({ "channel": room, "text": text })).await
    }

    async fn reply(&self, room: &str, message_id: &str, text: &str) -> Result<String> {
        self.post_message(json!({ "channel": room, "text": text, "thread_ts": message_id }))
            .await
    }

    async fn react(&self, room: &str, message_id: &str, emoji: &str) -> Result<()> {
        let response = self
            .post(
                "reactions.add",
                json!({ "channel": room, "timestamp": message_id, "name": emoji_name(emoji) }),
            )
            .await?;
        if response.error_is("already_reacted") {
            return Ok(());
        }
        response.into_result("reactions.add").map(|_| ())
    }

    async fn permalink(&self, room: &str, message_id: &str) -> Result<Option<String>> {
        let response = self
            .get("chat.getPermalink", &[("channel", room), ("message_ts", message_id)])
            .await?;
        if response.error_is("message_not_found") {
            return Ok(None);
        }
        let body = response.into_result("chat.getPermalink")?;
        Ok(str_field(&body, "permalink"))
    }

    async fn join(&self, room: &str) -> Result<()> {
        self.post("conversations.join", json!({ "channel": room }))
            .await?
            .into_result("conversations.join")?;
        tracing::info!("👋 Joined {room}");
        Ok(())
    }

    async fn leave(&self, room: &str) -> Result<()> {
        let response = self.post("conversations.leave", json!({ "channel": room })).await?;
        if response.error_is("not_in_channel") {
            return Ok(());
        }
        response.into_result("conversations.leave").map(|_| ())
    }

    async fn joined_rooms(&self) -> Result<Vec<String>> {
        let mut rooms = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut query = vec![
                ("types", "public_channel,private_channel"),
                ("exclude_archived", "true"),
                ("limit", "200"),
            ];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.as_str()));
            }
            let body = self
                .get("users.conversations", &query)
                .await?
                .into_result("users.conversations")?;

            if let Some(channels) = body.get("channels").and_then(Value::as_array) {
                rooms.extend(
                    channels
                        .iter()
                        .filter_map(|c| c.get("id").and_then(Value::as_str))
                        .map(str::to_string),
                );
            }

            cursor = body
                .get("response_metadata")
                .and_then(|m| m.get("next_cursor"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if cursor.is_empty() {
                break;
            }
        }
        Ok(rooms)
    }

    async fn resolve_user(&self, user_id: &str) -> Result<Option<ChatUser>> {
        let response = self.get("users.info", &[("user", user_id)]).await?;
        if response.error_is("user_not_found") {
            return Ok(None);
        }
        let body = response.into_result("users.info")?;
        Ok(parse_user(&body))
    }
}
