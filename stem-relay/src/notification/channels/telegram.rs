//! Telegram Bot API notification channel.
//!
//! Sends messages via the Telegram Bot API (`POST /bot<token>/sendMessage`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::NotificationChannel;
use crate::utils::http_client::build_notify_client;
use crate::{Error, Result};

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Telegram channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram Bot API token.
    pub bot_token: Option<String>,
    /// Target chat ID (user, group, or channel).
    pub chat_id: Option<String>,
    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_timeout() -> u64 {
    5
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_base: default_api_base(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Telegram notification channel.
pub struct TelegramChannel {
    config: TelegramConfig,
    client: Client,
}

impl TelegramChannel {
    /// Create a new Telegram channel.
    pub fn new(config: TelegramConfig) -> Self {
        let client = build_notify_client(Duration::from_secs(config.timeout_secs));
        Self { config, client }
    }

    fn endpoint(&self, token: &str) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            token
        )
    }

    /// Plain text body; failure traces routinely contain markup characters.
    fn build_message(&self, subject: &str, body: &str) -> String {
        truncate_message(&format!("{subject}\n\n{body}"), TELEGRAM_MESSAGE_LIMIT)
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    fn is_configured(&self) -> bool {
        self.config.bot_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.config.chat_id.as_deref().is_some_and(|c| !c.is_empty())
    }

    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let (Some(token), Some(chat_id)) = (&self.config.bot_token, &self.config.chat_id) else {
            return Err(Error::notification("Telegram channel is not configured"));
        };

        let payload = json!({
            "chat_id": chat_id,
            "text": self.build_message(subject, body),
        });

        let response = self
            .client
            .post(self.endpoint(token))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::notification(format!(
                "Telegram sendMessage failed: {status} - {body}"
            )));
        }

        debug!("Telegram notification sent");
        Ok(())
    }
}

/// Truncate a message to fit within the Telegram character limit.
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit - suffix.len();
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}
