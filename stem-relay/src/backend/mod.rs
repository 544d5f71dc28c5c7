//! Shared state backend adapters.
//!
//! Components never talk to a transport directly. They receive an explicitly
//! constructed backend at startup:
//! - [`RedisBackend`] for deployments where workers run as separate processes
//! - [`MemoryBackend`] for tests and single-process runs
//!
//! Adapter methods return [`crate::Result`]; turning a failure into a logged
//! default is the job of [`degrade::Degrade`] in the component layer.

pub mod degrade;
mod memory;
mod redis_backend;

pub use degrade::Degrade;
pub use memory::MemoryBackend;
pub use redis_backend::{RedisBackend, RedisConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;

use crate::Result;

/// Hash and counter operations used by the status store and retry counters.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Overwrite the given hash fields, creating the hash if needed.
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// All fields of a hash; empty when the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Remove one field from a hash.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<()>;

    /// Every key starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically increment an integer key, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Read an integer key.
    async fn get_int(&self, key: &str) -> Result<Option<i64>>;

    /// Delete a key. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Outcome of a consumer group creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// A raw entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// A delivered-but-unacknowledged entry of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    /// Time since the entry was last delivered.
    #[serde(rename = "idle_ms", serialize_with = "serialize_millis")]
    pub idle: Duration,
    pub deliveries: u64,
}

fn serialize_millis<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(value.as_millis() as u64)
}

/// Append-only streams with consumer groups.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Create `group` on `stream` at the stream tail, creating the stream if needed.
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation>;

    /// Append an entry and return its id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;

    /// Claim up to `count` never-delivered entries for `consumer`. Does not wait.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge entries, returning how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64>;

    /// Transfer up to `count` pending entries idle for at least `min_idle` to `consumer`.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Reset the idle time of pending entries held by `consumer`, keeping
    /// them out of reach of [`StreamBackend::auto_claim`]. Returns how many
    /// entries were refreshed. Delivery counts are unchanged.
    async fn touch(&self, stream: &str, group: &str, consumer: &str, ids: &[String]) -> Result<u64>;

    /// Pending entries of a group, oldest first.
    async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>>;

    /// Signal fired on append, for backends that can wake waiting consumers.
    fn append_signal(&self) -> Option<Arc<Notify>> {
        None
    }
}
