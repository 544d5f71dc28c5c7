//! In-process backend with Redis-compatible semantics.
//!
//! Stream ids, consumer group cursors and pending sets behave like their Redis
//! counterparts, so components can be exercised without a server.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{GroupCreation, KeyValueBackend, PendingEntry, StreamBackend, StreamEntry};
use crate::{Error, Result};

/// Stream entry id: milliseconds plus a sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl EntryId {
    fn parse(raw: &str) -> Option<Self> {
        let (ms, seq) = raw.split_once('-')?;
        Some(Self {
            ms: ms.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

#[derive(Debug)]
struct PendingSlot {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingSlot>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<(EntryId, HashMap<String, String>)>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn entry(&self, id: EntryId) -> Option<StreamEntry> {
        self.entries
            .binary_search_by(|(candidate, _)| candidate.cmp(&id))
            .ok()
            .map(|index| StreamEntry {
                id: id.to_string(),
                fields: self.entries[index].1.clone(),
            })
    }

    fn next_id(&mut self) -> EntryId {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let id = if now_ms > self.last_id.ms {
            EntryId { ms: now_ms, seq: 0 }
        } else {
            EntryId {
                ms: self.last_id.ms,
                seq: self.last_id.seq + 1,
            }
        };
        self.last_id = id;
        id
    }
}

#[derive(Debug, Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    counters: HashMap<String, i64>,
    streams: HashMap<String, Stream>,
}

/// Backend that keeps everything in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    offline: Arc<AtomicBool>,
    appended: Arc<Notify>,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("offline", &self.offline.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while offline every operation fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::backend("memory backend is offline"))
        } else {
            Ok(())
        }
    }
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::backend(format!(
        "NOGROUP no such key '{stream}' or consumer group '{group}'"
    ))
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check_online()?;
        Ok(self.state.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock();
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                state.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_online()?;
        let state = self.state.lock();
        let keys = state
            .hashes
            .keys()
            .chain(state.counters.keys())
            .chain(state.streams.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(keys)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.check_online()?;
        let mut state = self.state.lock();
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>> {
        self.check_online()?;
        Ok(self.state.lock().counters.get(key).copied())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.hashes.remove(key);
        state.counters.remove(key);
        state.streams.remove(key);
        Ok(())
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation> {
        self.check_online()?;
        let mut state = self.state.lock();
        let stream = state.streams.entry(stream.to_string()).or_default();
        if stream.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        let tail = stream.last_id;
        stream.groups.insert(
            group.to_string(),
            Group {
                last_delivered: tail,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupCreation::Created)
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        self.check_online()?;
        let id = {
            let mut state = self.state.lock();
            let stream = state.streams.entry(stream.to_string()).or_default();
            let id = stream.next_id();
            stream.entries.push((id, fields.iter().cloned().collect()));
            id
        };
        self.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group_name: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.check_online()?;
        let mut state = self.state.lock();
        let stream = state
            .streams
            .get_mut(stream_key)
            .ok_or_else(|| no_group(stream_key, group_name))?;
        let group = stream
            .groups
            .get_mut(group_name)
            .ok_or_else(|| no_group(stream_key, group_name))?;

        let start = stream
            .entries
            .partition_point(|(id, _)| *id <= group.last_delivered);
        let now = Instant::now();
        let mut delivered = Vec::new();
        for (id, fields) in stream.entries[start..].iter().take(count) {
            group.pending.insert(
                *id,
                PendingSlot {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            group.last_delivered = *id;
            delivered.push(StreamEntry {
                id: id.to_string(),
                fields: fields.clone(),
            });
        }
        Ok(delivered)
    }

    async fn ack(&self, stream_key: &str, group_name: &str, ids: &[String]) -> Result<u64> {
        self.check_online()?;
        let mut state = self.state.lock();
        let Some(group) = state
            .streams
            .get_mut(stream_key)
            .and_then(|stream| stream.groups.get_mut(group_name))
        else {
            return Ok(0);
        };

        let acked = ids
            .iter()
            .filter_map(|raw| EntryId::parse(raw))
            .filter(|id| group.pending.remove(id).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn auto_claim(
        &self,
        stream_key: &str,
        group_name: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.check_online()?;
        let mut state = self.state.lock();
        let stream = state
            .streams
            .get_mut(stream_key)
            .ok_or_else(|| no_group(stream_key, group_name))?;
        let Stream {
            entries, groups, ..
        } = stream;
        let group = groups
            .get_mut(group_name)
            .ok_or_else(|| no_group(stream_key, group_name))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, slot) in group.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(slot.delivered_at) < min_idle {
                continue;
            }
            slot.consumer = consumer.to_string();
            slot.delivered_at = now;
            slot.deliveries += 1;
            if let Ok(index) = entries.binary_search_by(|(candidate, _)| candidate.cmp(id)) {
                claimed.push(StreamEntry {
                    id: id.to_string(),
                    fields: entries[index].1.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn touch(
        &self,
        stream_key: &str,
        group_name: &str,
        consumer: &str,
        ids: &[String],
    ) -> Result<u64> {
        self.check_online()?;
        let mut state = self.state.lock();
        let group = state
            .streams
            .get_mut(stream_key)
            .and_then(|stream| stream.groups.get_mut(group_name))
            .ok_or_else(|| no_group(stream_key, group_name))?;

        let now = Instant::now();
        let mut touched = 0;
        for id in ids.iter().filter_map(|raw| EntryId::parse(raw)) {
            if let Some(slot) = group.pending.get_mut(&id) {
                slot.consumer = consumer.to_string();
                slot.delivered_at = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn pending(
        &self,
        stream_key: &str,
        group_name: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        self.check_online()?;
        let state = self.state.lock();
        let group = state
            .streams
            .get(stream_key)
            .and_then(|stream| stream.groups.get(group_name))
            .ok_or_else(|| no_group(stream_key, group_name))?;

        let now = Instant::now();
        Ok(group
            .pending
            .iter()
            .take(count)
            .map(|(id, slot)| PendingEntry {
                id: id.to_string(),
                consumer: slot.consumer.clone(),
                idle: now.duration_since(slot.delivered_at),
                deliveries: slot.deliveries,
            })
            .collect())
    }

    fn append_signal(&self) -> Option<Arc<Notify>> {
        Some(self.appended.clone())
    }
}

impl MemoryBackend {
    /// Look up a single stream entry by id.
    pub fn stream_entry(&self, stream: &str, id: &str) -> Option<StreamEntry> {
        let state = self.state.lock();
        let id = EntryId::parse(id)?;
        state.streams.get(stream)?.entry(id)
    }
}
