//! Stage worker: consumes a stage's input topic and drives its processor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Pipeline, Stage};
use crate::bus::StreamMessage;
use crate::status::{FileStatus, StatusUpdate};

/// Record field naming the stage currently working on a file.
pub const STAGE_FIELD: &str = "stage";

/// Result of a successful stage run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    /// Auxiliary fields merged into the file's record.
    pub extra: BTreeMap<String, String>,
}

impl StageOutput {
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// The unit of work of one stage.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Stage this processor implements.
    fn stage(&self) -> Stage;

    /// Process one file. Errors are retried by the executor.
    async fn process(&self, filename: &str) -> anyhow::Result<StageOutput>;
}

/// Configuration for a stage worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Consumer group; defaults to the stage name.
    pub group: Option<String>,
    /// Consumer name prefix; defaults to `{stage}-{random}`.
    pub consumer: Option<String>,
    /// How long one poll waits for messages, in milliseconds.
    pub block_ms: u64,
    /// Messages claimed per poll.
    pub batch_size: usize,
    /// Concurrent consumers in this worker.
    pub concurrency: usize,
    /// Delay before retrying group creation, in milliseconds.
    pub group_retry_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: None,
            consumer: None,
            block_ms: 5000,
            batch_size: 1,
            concurrency: 1,
            group_retry_ms: 1000,
        }
    }
}

/// Outcome of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Processed and handed to the next topic.
    Advanced,
    /// Retries exhausted; recorded as a terminal error.
    Failed,
    /// Malformed message, dropped.
    Discarded,
    /// Left pending for redelivery.
    Deferred,
}

impl Handled {
    /// Whether the input message was acknowledged.
    pub fn acknowledged(self) -> bool {
        !matches!(self, Handled::Deferred)
    }
}

struct WorkerInner {
    pipeline: Pipeline,
    processor: Arc<dyn StageProcessor>,
    stage: Stage,
    group: String,
    block: Duration,
    batch_size: usize,
}

impl WorkerInner {
    async fn ensure_group(&self) -> bool {
        self.pipeline
            .bus()
            .ensure_group(self.stage.input_topic(), &self.group)
            .await
    }

    async fn fetch(&self, consumer: &str) -> Vec<StreamMessage> {
        self.pipeline
            .bus()
            .consume(
                self.stage.input_topic(),
                &self.group,
                consumer,
                self.block,
                self.batch_size,
            )
            .await
    }

    /// Handle one message. `held` lists the ids this consumer still owns from
    /// the current batch, this message's included; their claims are refreshed
    /// while the stage work runs.
    async fn handle(&self, consumer: &str, message: StreamMessage, held: &[String]) -> Handled {
        let stage = self.stage;
        let input = stage.input_topic();
        let bus = self.pipeline.bus();

        if message.filename.is_empty() {
            warn!(stage = %stage, id = %message.id, "Discarding message without filename");
            bus.ack(input, &self.group, &[message.id]).await;
            return Handled::Discarded;
        }

        let filename = message.filename;
        let status = self.pipeline.status();
        debug!(stage = %stage, consumer, filename = %filename, id = %message.id, "Processing message");

        status
            .update(
                &filename,
                StatusUpdate::new(FileStatus::Processing).with_extra(STAGE_FIELD, stage.as_ref()),
            )
            .await;

        let processor = &self.processor;
        let work = self
            .pipeline
            .executor()
            .run(stage, &filename, || processor.process(&filename));
        tokio::pin!(work);

        let keepalive = bus.keepalive_interval();
        // The ticker is only polled when a keep-alive period exists.
        let period = keepalive.unwrap_or(Duration::from_secs(3600));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = ticker.tick(), if keepalive.is_some() => {
                    let touched = bus.touch(input, &self.group, consumer, held).await;
                    debug!(stage = %stage, filename = %filename, touched, "Refreshed in-flight claims");
                }
            }
        };

        let outcome = match result {
            Ok(output) => {
                if let Err(e) = bus.publish(stage.output_topic(), &filename).await {
                    error!(
                        stage = %stage,
                        filename = %filename,
                        error = %e,
                        "Failed to hand off to next topic, leaving message pending"
                    );
                    return Handled::Deferred;
                }

                let next = if stage.is_final() {
                    FileStatus::Done
                } else {
                    FileStatus::Queued
                };
                status
                    .update(&filename, StatusUpdate::new(next).with_extras(output.extra))
                    .await;
                info!(stage = %stage, filename = %filename, status = %next, "Stage completed");
                Handled::Advanced
            }
            Err(e) if e.is_stage_failed() => {
                warn!(stage = %stage, filename = %filename, error = %e, "Stage failed permanently");
                Handled::Failed
            }
            Err(e) => {
                error!(stage = %stage, filename = %filename, error = %e, "Unexpected executor error");
                return Handled::Deferred;
            }
        };

        bus.ack(input, &self.group, &[message.id]).await;
        outcome
    }

    async fn handle_batch(&self, consumer: &str, batch: Vec<StreamMessage>) -> Vec<Handled> {
        let ids: Vec<String> = batch.iter().map(|message| message.id.clone()).collect();
        let mut handled = Vec::with_capacity(batch.len());
        for (index, message) in batch.into_iter().enumerate() {
            handled.push(self.handle(consumer, message, &ids[index..]).await);
        }
        handled
    }

    async fn poll(&self, consumer: &str) -> Vec<Handled> {
        let batch = self.fetch(consumer).await;
        self.handle_batch(consumer, batch).await
    }
}

/// Runs one stage's processor against its consumer group.
pub struct StageWorker {
    inner: Arc<WorkerInner>,
    consumer: String,
    concurrency: usize,
    group_retry: Duration,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl StageWorker {
    pub fn new(pipeline: Pipeline, processor: Arc<dyn StageProcessor>, config: WorkerConfig) -> Self {
        let stage = processor.stage();
        let group = config.group.unwrap_or_else(|| stage.to_string());
        let consumer = config
            .consumer
            .unwrap_or_else(|| format!("{stage}-{}", uuid::Uuid::new_v4().simple()));

        Self {
            inner: Arc::new(WorkerInner {
                pipeline,
                processor,
                stage,
                group,
                block: Duration::from_millis(config.block_ms),
                batch_size: config.batch_size.max(1),
            }),
            consumer,
            concurrency: config.concurrency.max(1),
            group_retry: Duration::from_millis(config.group_retry_ms.max(1)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn stage(&self) -> Stage {
        self.inner.stage
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Ensure the consumer group exists.
    pub async fn ensure_group(&self) -> bool {
        self.inner.ensure_group().await
    }

    /// Claim one batch as this worker's consumer and handle it.
    pub async fn poll_once(&self) -> Vec<Handled> {
        self.inner.poll(&self.consumer).await
    }

    fn consumer_name(&self, index: usize) -> String {
        if self.concurrency == 1 {
            self.consumer.clone()
        } else {
            format!("{}-{}", self.consumer, index)
        }
    }

    /// Spawn the consumer loops.
    pub fn start(&self) {
        let stage = self.inner.stage;
        info!(
            stage = %stage,
            group = %self.inner.group,
            consumers = self.concurrency,
            "Starting stage worker"
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!(stage = %stage, "Stage worker already stopped");
            return;
        };

        for i in 0..self.concurrency {
            let inner = self.inner.clone();
            let cancellation_token = self.cancellation_token.clone();
            let group_retry = self.group_retry;
            let consumer = self.consumer_name(i);

            join_set.spawn(async move {
                debug!(stage = %stage, consumer = %consumer, "Consumer started");

                while !inner.ensure_group().await {
                    tokio::select! {
                        _ = cancellation_token.cancelled() => return,
                        _ = tokio::time::sleep(group_retry) => {}
                    }
                }

                loop {
                    let batch = tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        batch = inner.fetch(&consumer) => batch,
                    };

                    // A claimed batch is finished before honouring cancellation.
                    inner.handle_batch(&consumer, batch).await;

                    if cancellation_token.is_cancelled() {
                        break;
                    }
                }

                debug!(stage = %stage, consumer = %consumer, "Consumer shutting down");
            });
        }
    }

    /// Stop all consumer loops and wait for them to exit.
    pub async fn stop(&self) {
        info!(stage = %self.inner.stage, "Stopping stage worker");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!(stage = %self.inner.stage, "Stage worker stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::bus::{BusConfig, StreamBus};
    use crate::notification::Notifier;
    use crate::pipeline::Topic;
    use crate::retry::RetryPolicy;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        stage: Stage,
        failures: u32,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(stage: Stage, failures: u32) -> Self {
            Self {
                stage,
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StageProcessor for Scripted {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn process(&self, filename: &str) -> anyhow::Result<StageOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(anyhow!("attempt {call} failed for {filename}"));
            }
            Ok(StageOutput::default().with_extra("duration", "12.5"))
        }
    }

    fn pipeline(backend: &MemoryBackend) -> Pipeline {
        Pipeline::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(Notifier::disabled()),
            RetryPolicy::default().with_retry_delay(Duration::from_millis(1)),
            BusConfig::default(),
        )
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            consumer: Some("w1".to_string()),
            block_ms: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_worker_defaults() {
        let backend = MemoryBackend::new();
        let worker = StageWorker::new(
            pipeline(&backend),
            Arc::new(Scripted::new(Stage::Splitter, 0)),
            WorkerConfig::default(),
        );
        assert_eq!(worker.group(), "splitter");
        assert!(worker.consumer().starts_with("splitter-"));
        assert!(worker.is_running());
    }

    #[tokio::test]
    async fn test_success_advances_file() {
        let backend = MemoryBackend::new();
        let pipeline = pipeline(&backend);
        let worker = StageWorker::new(
            pipeline.clone(),
            Arc::new(Scripted::new(Stage::Metadata, 0)),
            config(),
        );
        assert!(worker.ensure_group().await);
        pipeline.bus().ensure_group(Topic::MetadataDone, "splitter").await;

        pipeline.enqueue("song.wav").await.unwrap();
        assert_eq!(worker.poll_once().await, vec![Handled::Advanced]);

        let record = pipeline.status().get_record("song.wav").await.unwrap();
        assert_eq!(record.status, FileStatus::Queued);
        assert_eq!(record.extra.get("stage").map(String::as_str), Some("metadata"));
        assert_eq!(record.extra.get("duration").map(String::as_str), Some("12.5"));

        assert!(pipeline.bus().pending(Topic::Queued, "metadata", 10).await.is_empty());
        let next = pipeline
            .bus()
            .consume(Topic::MetadataDone, "splitter", "s1", Duration::from_millis(20), 10)
            .await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].filename, "song.wav");
    }

    #[tokio::test]
    async fn test_final_stage_marks_done() {
        let backend = MemoryBackend::new();
        let pipeline = pipeline(&backend);
        let worker = StageWorker::new(
            pipeline.clone(),
            Arc::new(Scripted::new(Stage::Organizer, 0)),
            config(),
        );
        worker.ensure_group().await;
        pipeline.bus().publish(Topic::Packaged, "song.wav").await.unwrap();

        assert_eq!(worker.poll_once().await, vec![Handled::Advanced]);
        assert_eq!(
            pipeline.status().get_status("song.wav").await.status,
            FileStatus::Done
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_acknowledged() {
        let backend = MemoryBackend::new();
        let pipeline = pipeline(&backend);
        let worker = StageWorker::new(
            pipeline.clone(),
            Arc::new(Scripted::new(Stage::Splitter, u32::MAX)),
            config(),
        );
        worker.ensure_group().await;
        pipeline.bus().publish(Topic::MetadataDone, "bad.wav").await.unwrap();

        assert_eq!(worker.poll_once().await, vec![Handled::Failed]);
        assert_eq!(
            pipeline.status().get_status("bad.wav").await.status,
            FileStatus::Error
        );
        assert!(pipeline.bus().pending(Topic::MetadataDone, "splitter", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_message_without_filename_is_discarded() {
        let backend = MemoryBackend::new();
        let pipeline = pipeline(&backend);
        let worker = StageWorker::new(
            pipeline.clone(),
            Arc::new(Scripted::new(Stage::Metadata, 0)),
            config(),
        );
        worker.ensure_group().await;
        pipeline.bus().publish(Topic::Queued, "  ").await.unwrap();

        let handled = worker.poll_once().await;
        assert_eq!(handled, vec![Handled::Discarded]);
        assert!(handled[0].acknowledged());
        assert!(pipeline.bus().pending(Topic::Queued, "metadata", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let backend = MemoryBackend::new();
        let pipeline = pipeline(&backend);
        let processor = Arc::new(Scripted::new(Stage::Metadata, 1));
        let worker = StageWorker::new(
            pipeline.clone(),
            processor.clone(),
            WorkerConfig {
                concurrency: 2,
                ..config()
            },
        );
        worker.start();
        pipeline.ensure_groups().await;
        pipeline.enqueue("song.wav").await.unwrap();

        let status = pipeline.status().clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while status.get_status("song.wav").await.status != FileStatus::Queued
                || processor.calls.load(Ordering::SeqCst) < 2
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        worker.stop().await;
        assert!(!worker.is_running());
        assert!(pipeline.bus().pending(Topic::Queued, "metadata", 10).await.is_empty());
    }

    struct Slow {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageProcessor for Slow {
        fn stage(&self) -> Stage {
            Stage::Metadata
        }

        async fn process(&self, _filename: &str) -> anyhow::Result<StageOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(StageOutput::default())
        }
    }

    async fn drain_downstream(bus: &StreamBus) -> usize {
        let batch = bus
            .consume(Topic::MetadataDone, "splitter", "observer", Duration::from_millis(20), 10)
            .await;
        let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
        bus.ack(Topic::MetadataDone, "splitter", &ids).await;
        ids.len()
    }

    /// Run two competing consumers whose work outlasts the reclaim window.
    /// Returns the number of `process` calls and of downstream messages.
    async fn run_contended(files: &[&str], batch_size: usize, delay: Duration) -> (u32, usize) {
        let backend = MemoryBackend::new();
        let pipeline = Pipeline::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            Arc::new(Notifier::disabled()),
            RetryPolicy::default(),
            BusConfig {
                poll_interval_ms: 5,
                reclaim_idle_ms: 100,
            },
        );
        let processor = Arc::new(Slow {
            delay,
            calls: AtomicU32::new(0),
        });
        let worker = StageWorker::new(
            pipeline.clone(),
            processor.clone(),
            WorkerConfig {
                batch_size,
                concurrency: 2,
                ..config()
            },
        );

        assert!(pipeline.ensure_groups().await);
        worker.start();
        for file in files {
            pipeline.enqueue(file).await.unwrap();
        }

        let bus = pipeline.bus();
        let mut delivered = 0;
        tokio::time::timeout(Duration::from_secs(10), async {
            while delivered < files.len()
                || !bus.pending(Topic::Queued, "metadata", 10).await.is_empty()
            {
                delivered += drain_downstream(bus).await;
            }
        })
        .await
        .unwrap();

        // Give a competing consumer the chance to pick up anything still claimable.
        tokio::time::sleep(Duration::from_millis(300)).await;
        delivered += drain_downstream(bus).await;

        worker.stop().await;
        (processor.calls.load(Ordering::SeqCst), delivered)
    }

    #[tokio::test]
    async fn test_long_running_message_is_processed_once() {
        let (calls, delivered) = run_contended(&["long.wav"], 1, Duration::from_millis(400)).await;
        assert_eq!(calls, 1);
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_queued_batch_messages_keep_their_claim() {
        let files = ["a.wav", "b.wav", "c.wav"];
        let (calls, delivered) = run_contended(&files, 3, Duration::from_millis(250)).await;
        assert_eq!(calls, 3);
        assert_eq!(delivered, 3);
    }
}
