//! Redis implementation of the backend traits.
//!
//! Hashes hold file records, plain integer keys hold retry counters and
//! Redis Streams carry the stage topics.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamClaimOptions, StreamId,
    StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{GroupCreation, KeyValueBackend, PendingEntry, StreamBackend, StreamEntry};
use crate::Result;

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://redis:6379`.
    pub url: String,
}

impl RedisConfig {
    /// Build a URL from a host and port pair.
    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self {
            url: format!("redis://{host}:{port}"),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::from_host_port("redis", 6379)
    }
}

/// Redis-backed state store and stream bus transport.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisBackend {
    /// Connect to Redis. The connection manager reconnects on its own afterwards.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!("Connecting to Redis at {}", config.url);

        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;

        info!("Successfully connected to Redis");
        Ok(Self { conn })
    }
}

fn entry_from_stream_id(stream_id: &StreamId) -> StreamEntry {
    let fields = stream_id
        .map
        .keys()
        .filter_map(|field| {
            stream_id
                .get::<String>(field)
                .map(|value| (field.clone(), value))
        })
        .collect();

    StreamEntry {
        id: stream_id.id.clone(),
        fields,
    }
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
        Ok(keys)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1i64).await?;
        Ok(value)
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation> {
        let mut conn = self.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, "$")
            .await
        {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "Consumer group already exists");
                Ok(GroupCreation::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &options).await?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|key| key.ids.iter().map(entry_from_stream_id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: i64 = conn.xack(stream, group, ids).await?;
        Ok(acked.max(0) as u64)
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                stream,
                group,
                consumer,
                min_idle.as_millis() as u64,
                "0-0",
                options,
            )
            .await?;

        Ok(reply.claimed.iter().map(entry_from_stream_id).collect())
    }

    async fn touch(&self, stream: &str, group: &str, consumer: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        // JUSTID resets the idle time without bumping the delivery counter.
        let options = StreamClaimOptions::default().with_justid();
        let claimed: Vec<String> = conn
            .xclaim_options(stream, group, consumer, 0u64, ids, options)
            .await?;
        Ok(claimed.len() as u64)
    }

    async fn pending(&self, stream: &str, group: &str, count: usize) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|pending| PendingEntry {
                id: pending.id,
                consumer: pending.consumer,
                idle: Duration::from_millis(pending.last_delivered_ms as u64),
                deliveries: pending.times_delivered as u64,
            })
            .collect())
    }
}
