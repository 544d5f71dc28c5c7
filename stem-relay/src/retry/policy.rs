//! Retry budget and inter-attempt delay.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// The same delay before every retry.
    #[default]
    Fixed,
    /// The delay doubles after every failed attempt, up to `max_delay_ms`.
    Exponential { max_delay_ms: u64 },
}

/// Retry settings for one stage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    /// Delay before the second attempt, in milliseconds.
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    /// Notify operators when the final attempt fails.
    pub notify_on_final_failure: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5000,
            backoff: Backoff::Fixed,
            notify_on_final_failure: true,
        }
    }
}

impl RetryPolicy {
    /// Number of attempts actually made; the work always runs at least once.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.retry_delay_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential { max_delay_ms } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor)
                    .min(Duration::from_millis(max_delay_ms))
            }
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn without_notification(mut self) -> Self {
        self.notify_on_final_failure = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay_after(1), Duration::from_secs(5));
        assert!(policy.notify_on_final_failure);
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), policy.delay_after(5));
    }

    #[test]
    fn test_exponential_delay_caps() {
        let policy = RetryPolicy {
            retry_delay_ms: 1000,
            backoff: Backoff::Exponential {
                max_delay_ms: 5000,
            },
            ..Default::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
        assert_eq!(policy.delay_after(40), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_retries_still_runs_once() {
        let policy = RetryPolicy::default().with_max_retries(0);
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn test_backoff_deserializes() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_retries":5,"retry_delay_ms":10,"notify_on_final_failure":false,
                "backoff":{"type":"exponential","max_delay_ms":100}}"#,
        )
        .unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential { max_delay_ms: 100 }
        );
    }
}
