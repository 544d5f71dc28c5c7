//! Generic webhook notification channel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::NotificationChannel;
use crate::utils::http_client::build_notify_client;
use crate::{Error, Result};

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL, e.g. a Slack incoming webhook.
    pub url: Option<String>,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Optional bearer token sent as `Authorization`.
    pub bearer_token: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    5
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            headers: Vec::new(),
            bearer_token: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// Generic webhook notification channel.
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    /// Create a new Webhook channel.
    pub fn new(config: WebhookConfig) -> Self {
        let client = build_notify_client(Duration::from_secs(config.timeout_secs));
        Self { config, client }
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        if let Some(token) = &self.config.bearer_token {
            if let Ok(value) = format!("Bearer {token}").parse() {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }

        headers
    }

    /// Build the JSON payload.
    fn build_payload(&self, body: &str) -> serde_json::Value {
        json!({ "text": body })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn channel_type(&self) -> &'static str {
        "webhook"
    }

    fn is_configured(&self) -> bool {
        self.config.url.as_deref().is_some_and(|url| !url.is_empty())
    }

    async fn send(&self, _subject: &str, body: &str) -> Result<()> {
        let Some(url) = &self.config.url else {
            return Err(Error::notification("Webhook channel is not configured"));
        };

        let response = self
            .client
            .post(url)
            .headers(self.build_headers())
            .json(&self.build_payload(body))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::notification(format!(
                "Webhook failed: {status} - {body}"
            )));
        }

        debug!("Webhook notification sent");
        Ok(())
    }
}
