//! stem-relay library crate.
//!
//! Coordination layer for a multi-stage media pipeline: per-file status,
//! retry bookkeeping, durable stage topics and operator notifications.

pub mod backend;
pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod notification;
pub mod pipeline;
pub mod retry;
pub mod status;
pub mod utils;

pub use error::{Error, Result};
