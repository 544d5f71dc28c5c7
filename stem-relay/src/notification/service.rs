//! Fan-out notifier.
//!
//! Delivery is best-effort: every channel is tried independently, failures
//! and timeouts are logged, nothing is retried and the caller never sees an
//! error. Pipeline correctness never depends on a notification arriving.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::channels::{
    EmailChannel, EmailConfig, NotificationChannel, TelegramChannel, TelegramConfig,
    WebhookChannel, WebhookConfig,
};

/// Configuration for the notifier and its built-in channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub email: EmailConfig,
    /// Upper bound on a single channel send, in seconds. 0 disables the bound.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

fn default_send_timeout() -> u64 {
    15
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            webhook: WebhookConfig::default(),
            email: EmailConfig::default(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

/// Outcome of one fan-out, by channel type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    pub delivered: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

enum Outcome {
    Delivered,
    Skipped,
    Failed,
}

/// Sends a message to every configured channel.
pub struct Notifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
    send_timeout: Option<Duration>,
}

impl Notifier {
    /// A notifier over an explicit set of channels.
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self {
            channels,
            send_timeout: None,
        }
    }

    /// A notifier with no channels; every call is a no-op.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Build the Telegram, webhook and email channels from configuration.
    pub fn from_config(config: &NotifierConfig) -> Self {
        let channels: Vec<Arc<dyn NotificationChannel>> = vec![
            Arc::new(TelegramChannel::new(config.telegram.clone())),
            Arc::new(WebhookChannel::new(config.webhook.clone())),
            Arc::new(EmailChannel::new(config.email.clone())),
        ];

        let configured: Vec<&str> = channels
            .iter()
            .filter(|c| c.is_configured())
            .map(|c| c.channel_type())
            .collect();
        info!(channels = ?configured, "Notifier initialized");

        Self::new(channels).with_send_timeout(Duration::from_secs(config.send_timeout_secs))
    }

    /// Bound every channel send. A zero duration removes the bound.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Add a channel.
    pub fn add_channel(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.push(channel);
    }

    /// Number of channels, configured or not.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    async fn deliver(&self, channel: &dyn NotificationChannel, subject: &str, body: &str) -> Outcome {
        let channel_type = channel.channel_type();
        if !channel.is_configured() {
            info!(channel = channel_type, "Notification skipped: channel not configured");
            return Outcome::Skipped;
        }

        let send = channel.send(subject, body);
        let result = match self.send_timeout {
            Some(limit) => match tokio::time::timeout(limit, send).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(channel = channel_type, timeout = ?limit, "Notification timed out");
                    return Outcome::Failed;
                }
            },
            None => send.await,
        };

        match result {
            Ok(()) => {
                debug!(channel = channel_type, "Notification delivered");
                Outcome::Delivered
            }
            Err(e) => {
                warn!(channel = channel_type, error = %e, "Notification failed");
                Outcome::Failed
            }
        }
    }

    /// Send `subject`/`body` on every channel concurrently.
    pub async fn notify_all(&self, subject: &str, body: &str) -> NotifyReport {
        let outcomes = join_all(
            self.channels
                .iter()
                .map(|channel| self.deliver(channel.as_ref(), subject, body)),
        )
        .await;

        let mut report = NotifyReport::default();
        for (channel, outcome) in self.channels.iter().zip(outcomes) {
            let bucket = match outcome {
                Outcome::Delivered => &mut report.delivered,
                Outcome::Skipped => &mut report.skipped,
                Outcome::Failed => &mut report.failed,
            };
            bucket.push(channel.channel_type());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct TestChannel {
        channel_type: &'static str,
        configured: bool,
        fail: bool,
        hang: bool,
        sent: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl TestChannel {
        fn new(channel_type: &'static str) -> Self {
            Self {
                channel_type,
                configured: true,
                fail: false,
                hang: false,
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl NotificationChannel for TestChannel {
        fn channel_type(&self) -> &'static str {
            self.channel_type
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn send(&self, subject: &str, body: &str) -> Result<()> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(Error::notification("forced failure"));
            }
            self.sent.lock().push((subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_from_default_config_has_three_channels() {
        let notifier = Notifier::from_config(&NotifierConfig::default());
        assert_eq!(notifier.channel_count(), 3);
    }

    #[tokio::test]
    async fn test_unconfigured_channels_are_skipped() {
        let notifier = Notifier::from_config(&NotifierConfig::default());
        let report = notifier.notify_all("subject", "body").await;
        assert!(report.delivered.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(report.skipped, vec!["telegram", "webhook", "email"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_channels() {
        let ok = TestChannel::new("ok");
        let sent = ok.sent.clone();
        let broken = TestChannel {
            fail: true,
            ..TestChannel::new("broken")
        };
        let off = TestChannel {
            configured: false,
            ..TestChannel::new("off")
        };

        let notifier = Notifier::new(vec![Arc::new(broken), Arc::new(ok), Arc::new(off)]);
        let report = notifier.notify_all("Pipeline Error [metadata]", "details").await;

        assert_eq!(report.delivered, vec!["ok"]);
        assert_eq!(report.failed, vec!["broken"]);
        assert_eq!(report.skipped, vec!["off"]);
        assert_eq!(
            sent.lock().as_slice(),
            &[("Pipeline Error [metadata]".to_string(), "details".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_channel_times_out() {
        let ok = TestChannel::new("ok");
        let hung = TestChannel {
            hang: true,
            ..TestChannel::new("hung")
        };

        let notifier = Notifier::new(vec![Arc::new(hung), Arc::new(ok)])
            .with_send_timeout(Duration::from_secs(5));
        let report = notifier.notify_all("s", "b").await;

        assert_eq!(report.delivered, vec!["ok"]);
        assert_eq!(report.failed, vec!["hung"]);
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_noop() {
        let report = Notifier::disabled().notify_all("s", "b").await;
        assert_eq!(report, NotifyReport::default());
    }
}
