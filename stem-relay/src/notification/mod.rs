//! Notification system module.
//!
//! Operators are alerted when a stage exhausts its retries. Alerts fan out
//! to every configured channel (Telegram, webhook, email); a channel without
//! configuration is skipped and a failing channel never affects the others.
//!
//! # Example
//!
//! ```ignore
//! use stem_relay::notification::{Notifier, NotifierConfig};
//! use stem_relay::notification::channels::WebhookConfig;
//!
//! let config = NotifierConfig {
//!     webhook: WebhookConfig {
//!         url: Some("https://hooks.slack.com/services/...".to_string()),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//!
//! let notifier = Notifier::from_config(&config);
//! notifier.notify_all("Pipeline Error [splitter]", "details").await;
//! ```

pub mod channels;
pub mod service;

pub use channels::{EmailConfig, NotificationChannel, TelegramConfig, WebhookConfig};
pub use service::{Notifier, NotifierConfig, NotifyReport};
