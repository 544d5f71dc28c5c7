//! Application configuration.
//!
//! Every section has serde-friendly defaults. [`AppConfig::from_env`] fills
//! them from the process environment (after loading a `.env` file if present).

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::RedisConfig;
use crate::bus::BusConfig;
use crate::logging::{LogConfig, LogFormat};
use crate::notification::NotifierConfig;
use crate::notification::channels::parse_recipients;
use crate::pipeline::WorkerConfig;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();

        if let Some(url) = var("REDIS_URL") {
            config.redis.url = url;
        } else if var("REDIS_HOST").is_some() || var("REDIS_PORT").is_some() {
            let host = var("REDIS_HOST").unwrap_or_else(|| "redis".to_string());
            let port: u16 = parse_var("REDIS_PORT", var("REDIS_PORT"))?.unwrap_or(6379);
            config.redis = RedisConfig::from_host_port(&host, port);
        }

        let telegram = &mut config.notifier.telegram;
        telegram.bot_token = var("TELEGRAM_BOT_TOKEN");
        telegram.chat_id = var("TELEGRAM_CHAT_ID");

        config.notifier.webhook.url = var("SLACK_WEBHOOK_URL");

        let email = &mut config.notifier.email;
        email.smtp_server = var("SMTP_SERVER");
        if let Some(port) = parse_var("SMTP_PORT", var("SMTP_PORT"))? {
            email.smtp_port = port;
        }
        email.smtp_username = var("SMTP_USERNAME");
        email.smtp_password = var("SMTP_PASSWORD");
        email.recipients = var("NOTIFY_EMAILS")
            .map(|raw| parse_recipients(&raw))
            .unwrap_or_default();

        if let Some(max_retries) = parse_var("MAX_RETRIES", var("MAX_RETRIES"))? {
            config.retry.max_retries = max_retries;
        }
        if let Some(secs) = parse_var::<u64>("RETRY_DELAY_SECS", var("RETRY_DELAY_SECS"))? {
            config.retry = config.retry.with_retry_delay(Duration::from_secs(secs));
        }

        if let Some(secs) = parse_var::<u64>("RECLAIM_IDLE_SECS", var("RECLAIM_IDLE_SECS"))? {
            config.bus.reclaim_idle_ms = secs.saturating_mul(1000);
        }

        let worker = &mut config.worker;
        worker.consumer = var("WORKER_CONSUMER");
        if let Some(concurrency) = parse_var("WORKER_CONCURRENCY", var("WORKER_CONCURRENCY"))? {
            worker.concurrency = concurrency;
        }
        if let Some(batch_size) = parse_var("WORKER_BATCH_SIZE", var("WORKER_BATCH_SIZE"))? {
            worker.batch_size = batch_size;
        }

        config.log.level = var("LOG_LEVEL");
        if let Some(format) = parse_var::<LogFormat>("LOG_FORMAT", var("LOG_FORMAT"))? {
            config.log.format = format;
        }

        Ok(config)
    }
}

fn parse_var<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::config(format!("invalid {name}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.redis.url, "redis://redis:6379");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.retry_delay_ms, 5000);
        assert!(config.notifier.telegram.bot_token.is_none());
        assert!(config.notifier.email.recipients.is_empty());
        assert_eq!(config.log.format, LogFormat::Text);
        assert_eq!(config.worker.concurrency, 1);
        assert!(config.worker.consumer.is_none());
        assert_eq!(config.bus.reclaim_idle_ms, 300_000);
    }

    #[test]
    fn test_full_environment() {
        let config = load(&[
            ("REDIS_HOST", "cache"),
            ("REDIS_PORT", "6380"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "-100"),
            ("SLACK_WEBHOOK_URL", "https://hooks.example/x"),
            ("NOTIFY_EMAILS", "a@example.com, b@example.com,"),
            ("SMTP_SERVER", "smtp.example.com"),
            ("SMTP_PORT", "2525"),
            ("SMTP_USERNAME", "bot@example.com"),
            ("SMTP_PASSWORD", "secret"),
            ("MAX_RETRIES", "5"),
            ("RETRY_DELAY_SECS", "2"),
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "json"),
            ("RECLAIM_IDLE_SECS", "90"),
            ("WORKER_CONSUMER", "node-a"),
            ("WORKER_CONCURRENCY", "4"),
            ("WORKER_BATCH_SIZE", "8"),
        ])
        .unwrap();

        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.notifier.telegram.chat_id.as_deref(), Some("-100"));
        assert_eq!(
            config.notifier.webhook.url.as_deref(),
            Some("https://hooks.example/x")
        );
        assert_eq!(
            config.notifier.email.recipients,
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
        assert_eq!(config.notifier.email.smtp_port, 2525);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.retry_delay_ms, 2000);
        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.bus.reclaim_idle_ms, 90_000);
        assert_eq!(config.worker.consumer.as_deref(), Some("node-a"));
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.batch_size, 8);
    }

    #[test]
    fn test_redis_url_wins_over_host() {
        let config = load(&[("REDIS_URL", "redis://10.0.0.1:7000/2"), ("REDIS_HOST", "x")]).unwrap();
        assert_eq!(config.redis.url, "redis://10.0.0.1:7000/2");
    }

    #[test]
    fn test_blank_values_keep_defaults() {
        let config = load(&[("MAX_RETRIES", "  "), ("SLACK_WEBHOOK_URL", "")]).unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.notifier.webhook.url.is_none());
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = load(&[("MAX_RETRIES", "many")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("MAX_RETRIES"));
    }
}
