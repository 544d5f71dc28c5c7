//! Logging setup.
//!
//! Output goes to stderr with local-time timestamps, either human-readable or JSON.
//! The filter comes from `RUST_LOG`, then `LOG_LEVEL`, then [`DEFAULT_LOG_FILTER`].

use chrono::Local;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "stem_relay=info";

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Output format of log lines.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive or bare level, e.g. `debug` or `stem_relay=debug`.
    pub level: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
}

impl LogConfig {
    /// The filter directive to apply when `RUST_LOG` is not set.
    pub fn directive(&self) -> String {
        match self.level.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_LOG_FILTER.to_string(),
            Some(level) if level.contains('=') || level.contains(',') => level.to_string(),
            Some(level) => format!("stem_relay={}", level.to_ascii_lowercase()),
        }
    }
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directive()))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (text, json) = match config.format {
        LogFormat::Text => (
            Some(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_timer(LocalTimer),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_timer(LocalTimer),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to set global default subscriber: {}", e)))
}
