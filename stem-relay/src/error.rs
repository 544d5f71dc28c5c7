//! Application-wide error types.

use thiserror::Error;

use crate::pipeline::Stage;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backend error: {0}")]
    Backend(String),

    /// Terminal failure of a stage after its retry budget was spent.
    #[error("{stage} failed for {filename} after {attempts} attempt(s): {source}")]
    StageFailed {
        stage: Stage,
        filename: String,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn notification(msg: impl Into<String>) -> Self {
        Self::Notification(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn stage_failed(
        stage: Stage,
        filename: impl Into<String>,
        attempts: u32,
        source: anyhow::Error,
    ) -> Self {
        Self::StageFailed {
            stage,
            filename: filename.into(),
            attempts,
            source: source.into(),
        }
    }

    /// Whether this is a terminal stage failure.
    pub fn is_stage_failed(&self) -> bool {
        matches!(self, Self::StageFailed { .. })
    }
}
