//! Per (stage, file) attempt counters.

use std::sync::Arc;

use tracing::error;

use crate::backend::{Degrade, KeyValueBackend};
use crate::pipeline::Stage;
use crate::utils::filename::sanitize_filename;

fn counter_key(stage: Stage, filename: &str) -> String {
    format!("{stage}_retries:{filename}")
}

/// Attempt counters, created by the first increment and deleted on reset.
#[derive(Clone)]
pub struct RetryCounter {
    backend: Arc<dyn KeyValueBackend>,
}

impl RetryCounter {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// Current count; 0 when absent or unreadable.
    pub async fn get(&self, stage: Stage, filename: &str) -> u32 {
        let key = counter_key(stage, &sanitize_filename(filename));
        self.backend
            .get_int(&key)
            .await
            .or_degrade("retry_counter.get", None)
            .map(clamp)
            .unwrap_or(0)
    }

    /// Atomically increment and return the new count.
    ///
    /// On backend failure the count is left alone and the current value is
    /// returned instead.
    pub async fn increment(&self, stage: Stage, filename: &str) -> u32 {
        let filename = sanitize_filename(filename);
        match self.backend.incr(&counter_key(stage, &filename)).await {
            Ok(value) => clamp(value),
            Err(e) => {
                error!(stage = %stage, filename = %filename, error = %e, "Failed to increment retry counter");
                self.get(stage, &filename).await
            }
        }
    }

    /// Delete the counter. Idempotent.
    pub async fn reset(&self, stage: Stage, filename: &str) {
        let key = counter_key(stage, &sanitize_filename(filename));
        self.backend
            .delete(&key)
            .await
            .or_degrade("retry_counter.reset", ());
    }

    /// Delete the counters of every stage for a file.
    pub async fn reset_all(&self, filename: &str) {
        for stage in Stage::all() {
            self.reset(stage, filename).await;
        }
    }
}

fn clamp(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}
