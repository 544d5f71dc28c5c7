//! Email notification channel using SMTP.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::NotificationChannel;
use crate::utils::http_client::install_rustls_provider;
use crate::{Error, Result};

/// Email channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// SMTP server host.
    pub smtp_server: Option<String>,
    /// SMTP submission port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// SMTP username, also the default sender.
    pub smtp_username: Option<String>,
    /// SMTP password.
    pub smtp_password: Option<String>,
    /// Sender address; falls back to the username.
    pub from_address: Option<String>,
    /// Recipient email addresses.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Connection timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_timeout() -> u64 {
    10
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_server: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            from_address: None,
            recipients: Vec::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Split a comma separated recipient list.
pub(crate) fn parse_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect()
}

/// Email notification channel.
pub struct EmailChannel {
    config: EmailConfig,
}

impl EmailChannel {
    /// Create a new Email channel.
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn sender(&self) -> Option<&str> {
        self.config
            .from_address
            .as_deref()
            .or(self.config.smtp_username.as_deref())
    }

    /// Build the message for all recipients.
    fn build_message(&self, subject: &str, body: &str) -> Result<Message> {
        let from = self
            .sender()
            .ok_or_else(|| Error::notification("Email sender is not configured"))?;
        let from: Mailbox = from
            .parse()
            .map_err(|e| Error::notification(format!("Invalid sender address {from}: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.config.recipients {
            let to: Mailbox = recipient.parse().map_err(|e| {
                Error::notification(format!("Invalid recipient address {recipient}: {e}"))
            })?;
            builder = builder.to(to);
        }

        builder
            .body(body.to_string())
            .map_err(|e| Error::notification(format!("Failed to build email: {e}")))
    }

    fn build_transport(&self, host: &str) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        install_rustls_provider();

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| Error::notification(format!("Invalid SMTP relay {host}: {e}")))?
            .port(self.config.smtp_port)
            .timeout(Some(Duration::from_secs(self.config.timeout_secs)));

        if let (Some(username), Some(password)) =
            (&self.config.smtp_username, &self.config.smtp_password)
        {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn channel_type(&self) -> &'static str {
        "email"
    }

    fn is_configured(&self) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        present(&self.config.smtp_server)
            && present(&self.config.smtp_username)
            && present(&self.config.smtp_password)
            && !self.config.recipients.is_empty()
    }

    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let Some(host) = self.config.smtp_server.as_deref() else {
            return Err(Error::notification("Email channel is not configured"));
        };

        let message = self.build_message(subject, body)?;
        let transport = self.build_transport(host)?;

        transport
            .send(message)
            .await
            .map_err(|e| Error::notification(format!("SMTP send failed: {e}")))?;

        debug!(
            recipients = self.config.recipients.len(),
            "Email notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> EmailConfig {
        EmailConfig {
            smtp_server: Some("smtp.example.com".to_string()),
            smtp_username: Some("pipeline@example.com".to_string()),
            smtp_password: Some("secret".to_string()),
            recipients: vec!["ops@example.com".to_string(), "dev@example.com".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_email_config_default() {
        let config = EmailConfig::default();
        assert_eq!(config.smtp_port, 587);
        assert!(config.recipients.is_empty());
    }

    #[test]
    fn test_email_channel_requires_full_config() {
        assert!(!EmailChannel::new(EmailConfig::default()).is_configured());
        assert!(EmailChannel::new(configured()).is_configured());

        let mut missing_password = configured();
        missing_password.smtp_password = None;
        assert!(!EmailChannel::new(missing_password).is_configured());
    }

    #[test]
    fn test_parse_recipients() {
        assert_eq!(
            parse_recipients(" a@example.com, b@example.com ,,"),
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
        assert!(parse_recipients("").is_empty());
    }

    #[test]
    fn test_build_message() {
        let channel = EmailChannel::new(configured());
        let message = channel
            .build_message("Pipeline Error [packager]", "body")
            .unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Subject: Pipeline Error [packager]"));
        assert!(formatted.contains("ops@example.com"));
        assert!(formatted.contains("dev@example.com"));
    }

    #[test]
    fn test_invalid_recipient_is_an_error() {
        let mut config = configured();
        config.recipients = vec!["not an address".to_string()];
        let channel = EmailChannel::new(config);
        assert!(channel.build_message("s", "b").is_err());
    }

    #[test]
    fn test_sender_prefers_from_address() {
        let mut config = configured();
        config.from_address = Some("alerts@example.com".to_string());
        let channel = EmailChannel::new(config);
        assert_eq!(channel.sender(), Some("alerts@example.com"));
    }
}
