//! Durable topic bus with competing consumer groups.
//!
//! Delivery is at-least-once. A message stays in its consumer's pending set
//! until [`StreamBus::ack`]; pending messages idle for longer than the
//! configured reclaim window are handed to the next consumer that polls the
//! group, so a crashed worker's claims are eventually redelivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::backend::{Degrade, GroupCreation, PendingEntry, StreamBackend, StreamEntry};
use crate::pipeline::Topic;
use crate::utils::filename::sanitize_filename;

/// Field carrying the file reference in every message.
pub const FILENAME_FIELD: &str = "filename";

/// Configuration for the stream bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Poll interval in milliseconds while waiting for messages.
    pub poll_interval_ms: u64,
    /// Pending messages idle this long are reclaimed by polling consumers.
    pub reclaim_idle_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            reclaim_idle_ms: 300_000,
        }
    }
}

/// A file reference delivered from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub filename: String,
    /// Auxiliary fields published with the message.
    pub fields: HashMap<String, String>,
}

impl From<StreamEntry> for StreamMessage {
    fn from(entry: StreamEntry) -> Self {
        let mut fields = entry.fields;
        let filename = fields.remove(FILENAME_FIELD).unwrap_or_default();
        Self {
            id: entry.id,
            filename,
            fields,
        }
    }
}

/// Publish/consume access to the stage topics.
#[derive(Clone)]
pub struct StreamBus {
    backend: Arc<dyn StreamBackend>,
    config: BusConfig,
}

impl StreamBus {
    pub fn new(backend: Arc<dyn StreamBackend>, config: BusConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Create the topic and a group reading only messages published from now on.
    ///
    /// An existing group is left untouched. Returns whether the group is usable.
    pub async fn ensure_group(&self, topic: Topic, group: &str) -> bool {
        match self.backend.create_group(&topic.stream_key(), group).await {
            Ok(GroupCreation::Created) => {
                info!(topic = %topic, group, "Created consumer group");
                true
            }
            Ok(GroupCreation::AlreadyExists) => true,
            Err(e) => {
                error!(topic = %topic, group, error = %e, "Failed to ensure consumer group");
                false
            }
        }
    }

    /// Append a file reference to a topic.
    pub async fn publish(&self, topic: Topic, filename: &str) -> Result<String> {
        self.publish_with_fields(topic, filename, &HashMap::new())
            .await
    }

    /// Append a file reference with auxiliary fields.
    ///
    /// Returns the message id once the backend accepted the message. Unlike
    /// the consume side this surfaces errors: the caller decides whether an
    /// unpublished handoff should keep its own input message pending.
    pub async fn publish_with_fields(
        &self,
        topic: Topic,
        filename: &str,
        extra: &HashMap<String, String>,
    ) -> Result<String> {
        let filename = sanitize_filename(filename);
        let mut fields = vec![(FILENAME_FIELD.to_string(), filename.clone())];
        fields.extend(
            extra
                .iter()
                .filter(|(key, _)| key.as_str() != FILENAME_FIELD)
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let id = self.backend.append(&topic.stream_key(), &fields).await?;
        debug!(topic = %topic, filename = %filename, id = %id, "Published message");
        Ok(id)
    }

    /// Claim up to `count` messages for `consumer`.
    ///
    /// Stale pending messages of the group are reclaimed first; otherwise new
    /// messages are read. When nothing is available the call waits up to
    /// `block`, where a zero duration waits indefinitely. Backend errors are
    /// logged and yield an empty batch.
    pub async fn consume(
        &self,
        topic: Topic,
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Vec<StreamMessage> {
        let key = topic.stream_key();
        let count = count.max(1);
        let deadline = (!block.is_zero()).then(|| Instant::now() + block);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let reclaim_idle = Duration::from_millis(self.config.reclaim_idle_ms);
        let signal = self.backend.append_signal();

        loop {
            let appended = signal.as_ref().map(|s| s.notified());

            match self
                .backend
                .auto_claim(&key, group, consumer, reclaim_idle, count)
                .await
            {
                Ok(reclaimed) if !reclaimed.is_empty() => {
                    warn!(
                        topic = %topic,
                        group,
                        consumer,
                        count = reclaimed.len(),
                        "Reclaimed stale pending messages"
                    );
                    return reclaimed.into_iter().map(StreamMessage::from).collect();
                }
                Ok(_) => {}
                Err(e) => {
                    error!(topic = %topic, group, error = %e, "Failed to reclaim pending messages");
                    return Vec::new();
                }
            }

            match self.backend.read_group(&key, group, consumer, count).await {
                Ok(entries) if !entries.is_empty() => {
                    return entries.into_iter().map(StreamMessage::from).collect();
                }
                Ok(_) => {}
                Err(e) => {
                    error!(topic = %topic, group, error = %e, "Failed to read from consumer group");
                    return Vec::new();
                }
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Vec::new();
                    }
                    remaining.min(poll_interval)
                }
                None => poll_interval,
            };

            match appended {
                Some(appended) => {
                    tokio::select! {
                        _ = appended => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Acknowledge processed messages. Returns how many were pending.
    pub async fn ack(&self, topic: Topic, group: &str, ids: &[String]) -> u64 {
        self.backend
            .ack(&topic.stream_key(), group, ids)
            .await
            .or_degrade("bus.ack", 0)
    }

    /// Move pending messages idle for at least `min_idle` to `consumer`.
    pub async fn reclaim(
        &self,
        topic: Topic,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Vec<StreamMessage> {
        self.backend
            .auto_claim(&topic.stream_key(), group, consumer, min_idle, count)
            .await
            .or_degrade("bus.reclaim", Vec::new())
            .into_iter()
            .map(StreamMessage::from)
            .collect()
    }

    /// Refresh the claim `consumer` holds on in-flight messages.
    ///
    /// Long-running handlers call this more often than the reclaim window so
    /// a live consumer's messages are not mistaken for a crashed one's.
    pub async fn touch(&self, topic: Topic, group: &str, consumer: &str, ids: &[String]) -> u64 {
        self.backend
            .touch(&topic.stream_key(), group, consumer, ids)
            .await
            .or_degrade("bus.touch", 0)
    }

    /// How often in-flight claims are refreshed; `None` when reclaim is immediate.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.config.reclaim_idle_ms > 0)
            .then(|| Duration::from_millis((self.config.reclaim_idle_ms / 3).max(1)))
    }

    /// Pending messages of a group, oldest first.
    pub async fn pending(&self, topic: Topic, group: &str, count: usize) -> Vec<PendingEntry> {
        self.backend
            .pending(&topic.stream_key(), group, count)
            .await
            .or_degrade("bus.pending", Vec::new())
    }
}
