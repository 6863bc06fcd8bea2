//! # Breakbot Channels
//! Chat platform adapters. One is selected from `[chat] platform` at startup.

pub mod slack;

use std::sync::Arc;

use breakbot_core::config::ChatConfig;
use breakbot_core::error::{BreakbotError, Result};
use breakbot_core::traits::ChatAdapter;

pub use slack::SlackAdapter;

/// Build the chat adapter named by the config.
pub fn create_chat(config: &ChatConfig) -> Result<Arc<dyn ChatAdapter>> {
    match config.platform.as_str() {
        "slack" => {
            if config.bot_token.is_empty() {
                return Err(BreakbotError::Config(
                    "chat.bot_token is required for Slack (or set BREAKBOT_CHAT_TOKEN)".into(),
                ));
            }
            Ok(Arc::new(SlackAdapter::new(&config.api_base, &config.bot_token)))
        }
        other => Err(BreakbotError::Config(format!("Unknown chat platform: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_slack() {
        let config = ChatConfig {
            bot_token: "xoxb-test".into(),
            ..Default::default()
        };
        assert_eq!(create_chat(&config).unwrap().name(), "slack");
    }

    #[test]
    fn test_missing_token_and_unknown_platform() {
        assert!(matches!(
            create_chat(&ChatConfig::default()),
            Err(BreakbotError::Config(_))
        ));
        let config = ChatConfig {
            platform: "irc".into(),
            bot_token: "t".into(),
            ..Default::default()
        };
        assert!(create_chat(&config).is_err());
    }
}
