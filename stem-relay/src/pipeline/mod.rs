//! Pipeline wiring.
//!
//! [`Pipeline`] bundles the shared components every stage needs. It is built
//! once at startup from an explicit backend and handed to each
//! [`worker::StageWorker`]; nothing here holds process-global state.

pub mod stage;
pub mod worker;

pub use stage::{Stage, Topic};
pub use worker::{Handled, StageOutput, StageProcessor, StageWorker, WorkerConfig};

use std::sync::Arc;

use tracing::info;

use crate::Result;
use crate::backend::{KeyValueBackend, MemoryBackend, RedisBackend, StreamBackend};
use crate::bus::{BusConfig, StreamBus};
use crate::config::AppConfig;
use crate::notification::Notifier;
use crate::retry::{RetryCounter, RetryExecutor, RetryPolicy};
use crate::status::{FileStatus, StatusStore};
use crate::utils::filename::sanitize_filename;

/// Shared handles to the status store, counters, bus, notifier and executor.
#[derive(Clone)]
pub struct Pipeline {
    status: StatusStore,
    counters: RetryCounter,
    bus: StreamBus,
    notifier: Arc<Notifier>,
    executor: RetryExecutor,
    worker_config: WorkerConfig,
}

impl Pipeline {
    pub fn new(
        kv: Arc<dyn KeyValueBackend>,
        streams: Arc<dyn StreamBackend>,
        notifier: Arc<Notifier>,
        policy: RetryPolicy,
        bus_config: BusConfig,
    ) -> Self {
        let status = StatusStore::new(kv.clone());
        let counters = RetryCounter::new(kv);
        let executor = RetryExecutor::new(
            status.clone(),
            counters.clone(),
            notifier.clone(),
            policy,
        );

        Self {
            status,
            counters,
            bus: StreamBus::new(streams, bus_config),
            notifier,
            executor,
            worker_config: WorkerConfig::default(),
        }
    }

    /// Replace the defaults that [`Pipeline::worker`] starts from.
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Connect to Redis and build every component from configuration.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let backend = Arc::new(RedisBackend::connect(&config.redis).await?);
        let notifier = Arc::new(Notifier::from_config(&config.notifier));
        info!(
            max_retries = config.retry.max_retries,
            retry_delay_ms = config.retry.retry_delay_ms,
            "Pipeline connected"
        );

        Ok(Self::new(
            backend.clone(),
            backend,
            notifier,
            config.retry.clone(),
            config.bus.clone(),
        )
        .with_worker_config(config.worker.clone()))
    }

    /// A single-process pipeline over a memory backend.
    pub fn in_memory(backend: &MemoryBackend, notifier: Arc<Notifier>, policy: RetryPolicy) -> Self {
        let backend = Arc::new(backend.clone());
        Self::new(
            backend.clone(),
            backend,
            notifier,
            policy,
            BusConfig::default(),
        )
    }

    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    pub fn counters(&self) -> &RetryCounter {
        &self.counters
    }

    pub fn bus(&self) -> &StreamBus {
        &self.bus
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    pub fn worker_config(&self) -> &WorkerConfig {
        &self.worker_config
    }

    /// A worker for `processor` using the configured worker settings.
    pub fn worker(&self, processor: Arc<dyn StageProcessor>) -> StageWorker {
        StageWorker::new(self.clone(), processor, self.worker_config.clone())
    }

    /// Create every stage's default consumer group. Returns whether all succeeded.
    ///
    /// Groups start at the topic tail, so they must exist before files are
    /// published for the first time.
    pub async fn ensure_groups(&self) -> bool {
        let mut ok = true;
        for stage in Stage::all() {
            ok &= self.bus.ensure_group(stage.input_topic(), stage.as_ref()).await;
        }
        ok
    }

    /// Feed a file into the first stage and mark it queued.
    pub async fn enqueue(&self, filename: &str) -> Result<String> {
        let filename = sanitize_filename(filename);
        let id = self.bus.publish(Topic::Queued, &filename).await?;
        self.status.set_status(&filename, FileStatus::Queued).await;
        info!(filename = %filename, id = %id, "File enqueued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_publishes_and_marks_queued() {
        let backend = MemoryBackend::new();
        let pipeline = Pipeline::in_memory(
            &backend,
            Arc::new(Notifier::disabled()),
            RetryPolicy::default(),
        );
        assert!(pipeline.ensure_groups().await);

        let id = pipeline.enqueue(" song/one.wav ").await.unwrap();
        let entry = backend.stream_entry("pipeline:queued", &id).unwrap();
        assert_eq!(entry.fields["filename"], "song-one.wav");
        assert_eq!(
            pipeline.status().get_status("song-one.wav").await.status,
            FileStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_enqueue_fails_when_backend_down() {
        let backend = MemoryBackend::new();
        let pipeline = Pipeline::in_memory(
            &backend,
            Arc::new(Notifier::disabled()),
            RetryPolicy::default(),
        );
        backend.set_offline(true);
        assert!(!pipeline.ensure_groups().await);
        assert!(pipeline.enqueue("a.wav").await.is_err());
    }

    struct Noop;

    #[async_trait::async_trait]
    impl StageProcessor for Noop {
        fn stage(&self) -> Stage {
            Stage::Splitter
        }

        async fn process(&self, _filename: &str) -> anyhow::Result<StageOutput> {
            Ok(StageOutput::default())
        }
    }

    #[tokio::test]
    async fn test_worker_uses_configured_settings() {
        let backend = MemoryBackend::new();
        let pipeline = Pipeline::in_memory(
            &backend,
            Arc::new(Notifier::disabled()),
            RetryPolicy::default(),
        )
        .with_worker_config(WorkerConfig {
            consumer: Some("node-a".to_string()),
            block_ms: 20,
            ..Default::default()
        });
        assert_eq!(pipeline.worker_config().consumer.as_deref(), Some("node-a"));

        let worker = pipeline.worker(Arc::new(Noop));
        assert_eq!(worker.stage(), Stage::Splitter);
        assert_eq!(worker.group(), "splitter");
        assert_eq!(worker.consumer(), "node-a");

        assert!(pipeline.ensure_groups().await);
        pipeline
            .bus()
            .publish(Topic::MetadataDone, "a.wav")
            .await
            .unwrap();
        assert_eq!(worker.poll_once().await, vec![Handled::Advanced]);

        let pending = pipeline.bus().pending(Topic::MetadataDone, "splitter", 10).await;
        assert!(pending.is_empty());
    }
}
