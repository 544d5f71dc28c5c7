//! Retry bookkeeping and the auto-retry executor.

mod counter;
mod executor;
mod policy;

pub use counter::RetryCounter;
pub use executor::{FailureRecord, RetryExecutor};
pub use policy::{Backoff, RetryPolicy};
