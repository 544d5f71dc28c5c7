//! Bounded auto-retry around a stage's unit of work.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{RetryCounter, RetryPolicy};
use crate::notification::Notifier;
use crate::pipeline::Stage;
use crate::status::StatusStore;
use crate::utils::filename::sanitize_filename;
use crate::{Error, Result};

/// Detail of one failed attempt, stored as the record's `error` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: String,
    /// Cause chain, plus the backtrace when one was captured.
    pub trace: String,
}

impl FailureRecord {
    pub fn new(stage: Stage, attempt: u32, max_attempts: u32, error: &anyhow::Error) -> Self {
        Self {
            timestamp: Utc::now(),
            stage,
            attempt,
            max_attempts,
            error: error.to_string(),
            trace: format!("{error:?}"),
        }
    }

    /// Encode for storage.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{}\n{} (attempt {}/{})\n\n{}",
                self.timestamp.to_rfc3339(),
                self.error,
                self.attempt,
                self.max_attempts,
                self.trace
            )
        })
    }

    /// Decode a stored `error` field written by the executor.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Runs a stage's work with retries, status bookkeeping and escalation.
#[derive(Clone)]
pub struct RetryExecutor {
    status: StatusStore,
    counters: RetryCounter,
    notifier: Arc<Notifier>,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(
        status: StatusStore,
        counters: RetryCounter,
        notifier: Arc<Notifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            status,
            counters,
            notifier,
            policy,
        }
    }

    /// The default policy used by [`RetryExecutor::run`].
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` under the default policy.
    pub async fn run<T, F, Fut>(&self, stage: Stage, filename: &str, work: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_with_policy(stage, filename, &self.policy, work)
            .await
    }

    /// Run `work` until it succeeds or the attempt budget is spent.
    ///
    /// Returns the first successful result. After the final failed attempt
    /// operators are notified (when the policy asks for it) and
    /// [`Error::StageFailed`] wraps the last cause.
    pub async fn run_with_policy<T, F, Fut>(
        &self,
        stage: Stage,
        filename: &str,
        policy: &RetryPolicy,
        mut work: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let filename = sanitize_filename(filename);
        let max_attempts = policy.attempts();
        let mut attempt = 1;

        loop {
            let err = match work().await {
                Ok(value) => {
                    self.counters.reset(stage, &filename).await;
                    if attempt > 1 {
                        info!(stage = %stage, filename = %filename, attempt, "Stage succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retries = self.counters.increment(stage, &filename).await;
            let record = FailureRecord::new(stage, attempt, max_attempts, &err);
            self.status.set_error(&filename, record.to_json()).await;
            error!(
                stage = %stage,
                filename = %filename,
                attempt,
                max_attempts,
                retries,
                error = %err,
                "Pipeline stage error"
            );

            if attempt < max_attempts {
                let delay = policy.delay_after(attempt);
                debug!(stage = %stage, filename = %filename, delay = ?delay, "Waiting before retry");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if policy.notify_on_final_failure {
                let (subject, body) = final_failure_message(stage, &filename, &record);
                let report = self.notifier.notify_all(&subject, &body).await;
                debug!(
                    delivered = ?report.delivered,
                    failed = ?report.failed,
                    "Final failure notification dispatched"
                );
            }

            return Err(Error::stage_failed(stage, filename, max_attempts, err));
        }
    }
}

fn final_failure_message(stage: Stage, filename: &str, record: &FailureRecord) -> (String, String) {
    let subject = format!("Pipeline Error [{stage}]");
    let body = format!(
        "\u{274c} {} FAILED for {} after {} attempts\n\n{}\n\n{}",
        stage.title(),
        filename,
        record.max_attempts,
        record.error,
        record.trace
    );
    (subject, body)
}
