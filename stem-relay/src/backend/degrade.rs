//! Log-and-substitute policy for observability backends.
//!
//! Status, counter, bus and notifier I/O must never abort the pipeline. Every
//! best-effort call site funnels its `Result` through [`Degrade`], so the
//! swallow-and-log behavior lives in one place.

use tracing::error;

use crate::Result;

pub trait Degrade<T> {
    /// Return the value, or log the failure and return `fallback`.
    fn or_degrade(self, operation: &'static str, fallback: T) -> T;

    /// Return the value, or log the failure and build a fallback from the error.
    fn or_degrade_with<F>(self, operation: &'static str, fallback: F) -> T
    where
        F: FnOnce(&crate::Error) -> T;
}

impl<T> Degrade<T> for Result<T> {
    fn or_degrade(self, operation: &'static str, fallback: T) -> T {
        self.or_degrade_with(operation, |_| fallback)
    }

    fn or_degrade_with<F>(self, operation: &'static str, fallback: F) -> T
    where
        F: FnOnce(&crate::Error) -> T,
    {
        match self {
            Ok(value) => value,
            Err(e) => {
                error!(operation, error = %e, "Backend operation failed; continuing degraded");
                fallback(&e)
            }
        }
    }
}
