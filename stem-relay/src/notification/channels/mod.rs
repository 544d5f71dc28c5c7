//! Notification channels.
//!
//! This module provides different channels for delivering operator alerts:
//! - Telegram Bot API
//! - Generic webhooks (Slack-compatible `{"text": ...}` payload)
//! - Email (SMTP submission with STARTTLS)

mod email;
mod telegram;
mod webhook;

pub use email::{EmailChannel, EmailConfig};
pub(crate) use email::parse_recipients;
pub use telegram::{TelegramChannel, TelegramConfig};
pub use webhook::{WebhookChannel, WebhookConfig};

use async_trait::async_trait;

use crate::Result;

/// Trait for notification channels.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Get the channel type name.
    fn channel_type(&self) -> &'static str;

    /// Whether every setting the channel needs is present.
    fn is_configured(&self) -> bool;

    /// Deliver one message. Called only on configured channels.
    async fn send(&self, subject: &str, body: &str) -> Result<()>;
}
