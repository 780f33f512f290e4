//! # Pipeline Module
//!
//! Wires the buffer, provisioner, and batch processor together and enforces their
//! startup order: the schema provisioner runs to completion first, and the batch
//! processor task is only spawned after it succeeds. If provisioning fails, `start`
//! returns the error and no background task exists.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use logvault::connection::EnvConnectionSource;
//! use logvault::pipeline::{LogPipeline, SinkOptions};
//! use logvault::record::LogLevel;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), logvault::error::PipelineError> {
//! let pipeline = LogPipeline::new(SinkOptions::default());
//! let handle = pipeline.start(EnvConnectionSource::new("LOGVAULT_DB_URL")).await?;
//!
//! handle.emitter().log(LogLevel::Information, "billing", "invoice sent");
//!
//! handle.shutdown(Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```

use crate::buffer::{BufferCapacity, LogBuffer};
use crate::connection::ConnectionSource;
use crate::database::{DEFAULT_SCHEMA_NAME, DEFAULT_TABLE_NAME, LogSink, SinkTarget, SqlSink};
use crate::emitter::LogEmitter;
use crate::error::PipelineError;
use crate::processor::{BatchProcessor, ProcessorConfig, ProcessorStats, StatsSnapshot};
use crate::provision::SchemaProvisioner;
use crate::shutdown::ShutdownCoordinator;
use crate::worker::{Backoff, supervise};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Everything configurable about the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct SinkOptions {
    pub schema_name: String,
    pub table_name: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_cooldown: Duration,
    pub attempt_timeout: Duration,
    pub buffer_capacity: BufferCapacity,
    pub supervisor_backoff: Backoff,
}

impl Default for SinkOptions {
    fn default() -> Self {
        let processor = ProcessorConfig::default();
        Self {
            schema_name: DEFAULT_SCHEMA_NAME.to_string(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            batch_size: processor.batch_size,
            flush_interval: processor.flush_interval,
            retry_cooldown: processor.retry_cooldown,
            attempt_timeout: processor.attempt_timeout,
            buffer_capacity: BufferCapacity::Unbounded,
            supervisor_backoff: Backoff::default(),
        }
    }
}

impl SinkOptions {
    pub fn with_target(mut self, schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self.table_name = table_name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_retry_cooldown(mut self, retry_cooldown: Duration) -> Self {
        self.retry_cooldown = retry_cooldown;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_buffer_capacity(mut self, buffer_capacity: BufferCapacity) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn target(&self) -> Result<SinkTarget, PipelineError> {
        SinkTarget::new(&self.schema_name, &self.table_name)
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            retry_cooldown: self.retry_cooldown,
            attempt_timeout: self.attempt_timeout,
        }
    }
}

/// A pipeline that accepts records but has not started persisting them yet
pub struct LogPipeline {
    options: SinkOptions,
    buffer: Arc<LogBuffer>,
    coordinator: ShutdownCoordinator,
}

/// A running pipeline
pub struct PipelineHandle {
    emitter: LogEmitter,
    buffer: Arc<LogBuffer>,
    stats: Arc<ProcessorStats>,
    coordinator: ShutdownCoordinator,
    task: JoinHandle<u32>,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

impl LogPipeline {
    pub fn new(options: SinkOptions) -> Self {
        Self::with_coordinator(options, ShutdownCoordinator::new())
    }

    /// Share an existing shutdown coordinator (e.g. one wired to OS signals)
    pub fn with_coordinator(options: SinkOptions, coordinator: ShutdownCoordinator) -> Self {
        let buffer = Arc::new(LogBuffer::new(options.buffer_capacity));
        Self {
            options,
            buffer,
            coordinator,
        }
    }

    /// Emitter usable before `start`; records queue until the processor runs
    pub fn emitter(&self) -> LogEmitter {
        LogEmitter::new(self.buffer.clone())
    }

    pub fn options(&self) -> &SinkOptions {
        &self.options
    }

    /// Provision the SQL sink, then start the batch processor
    pub async fn start<C: ConnectionSource>(self, source: C) -> Result<PipelineHandle, PipelineError> {
        let target = match self.options.target() {
            Ok(target) => target,
            Err(e) => {
                error!(severity = "critical", error = %e, "Invalid log sink target");
                return Err(e);
            }
        };
        self.start_with_sink(source, SqlSink::new(target)).await
    }

    /// Provision `sink`, then start the batch processor against it
    pub async fn start_with_sink<C: ConnectionSource, S: LogSink>(
        self,
        source: C,
        sink: S,
    ) -> Result<PipelineHandle, PipelineError> {
        let source = Arc::new(source);
        let sink = Arc::new(sink);

        SchemaProvisioner::new(source.as_ref(), sink.as_ref())
            .provision()
            .await?;

        let processor = Arc::new(BatchProcessor::new(
            self.buffer.clone(),
            source,
            sink,
            self.options.processor_config(),
        ));
        let stats = processor.stats();
        let task = tokio::spawn(supervise(
            processor,
            self.coordinator.clone(),
            self.options.supervisor_backoff,
        ));

        info!(
            batch_size = self.options.batch_size,
            flush_interval = ?self.options.flush_interval,
            "Log pipeline started"
        );

        Ok(PipelineHandle {
            emitter: LogEmitter::new(self.buffer.clone()),
            buffer: self.buffer,
            stats,
            coordinator: self.coordinator,
            task,
        })
    }
}

impl PipelineHandle {
    pub fn emitter(&self) -> LogEmitter {
        self.emitter.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Records waiting in the buffer
    pub fn buffer_depth(&self) -> usize {
        self.buffer.depth()
    }

    /// Records rejected by a bounded buffer
    pub fn dropped(&self) -> u64 {
        self.buffer.dropped()
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Wait for the processor to stop after shutdown was signalled elsewhere
    pub async fn join(self, timeout: Duration) -> StatsSnapshot {
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(restarts)) => {
                info!(restarts, "Log pipeline stopped");
            }
            Ok(Err(e)) => {
                error!("Log pipeline supervisor failed: {}", e);
            }
            Err(_) => {
                warn!(
                    "Log pipeline did not stop within {:?}, buffered records may be lost",
                    timeout
                );
            }
        }
        let stats = self.stats.snapshot();
        let dropped = self.buffer.dropped();
        if dropped > 0 {
            warn!(dropped, "Records were rejected by the bounded log buffer");
        }
        stats
    }

    /// Signal shutdown, let the processor make its final flush, and wait for it
    pub async fn shutdown(self, timeout: Duration) -> StatsSnapshot {
        self.coordinator.initiate_shutdown();
        self.join(timeout).await
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{FnConnectionSource, StaticConnectionSource};
    use crate::database::memory::MemorySink;
    use crate::record::{LogLevel, LogRecord};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn fast_options() -> SinkOptions {
        SinkOptions::default()
            .with_flush_interval(Duration::from_millis(100))
            .with_retry_cooldown(Duration::from_millis(100))
    }

    fn sqlite_url(dir: &tempfile::TempDir) -> String {
        format!("sqlite://{}", dir.path().join("logs.db").display())
    }

    #[tokio::test]
    async fn test_start_aborts_without_connection_string() {
        let pipeline = LogPipeline::new(fast_options());
        pipeline
            .emitter()
            .log(LogLevel::Information, "boot", "queued before start");
        let buffer = pipeline.buffer.clone();
        let sink = MemorySink::new();

        let result = pipeline
            .start_with_sink(StaticConnectionSource::unresolved(), sink)
            .await;
        assert!(matches!(result, Err(PipelineError::ConnectionUnresolved)));

        // Nothing is consuming the buffer
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(buffer.depth(), 1);
    }

    #[tokio::test]
    async fn test_start_aborts_when_provisioning_fails() {
        let pipeline = LogPipeline::new(fast_options());
        pipeline.emitter().log(LogLevel::Error, "boot", "never shipped");
        let buffer = pipeline.buffer.clone();
        let sink = MemorySink::new();
        sink.fail_provisioning();

        let result = pipeline
            .start_with_sink(StaticConnectionSource::new("memory://sink"), sink)
            .await;
        assert!(matches!(result, Err(PipelineError::Provisioning(_))));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(buffer.depth(), 1);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_table_name() {
        let options = fast_options().with_target("logging", "system-logs");
        let dir = tempfile::tempdir().unwrap();
        let result = LogPipeline::new(options)
            .start(StaticConnectionSource::new(sqlite_url(&dir)))
            .await;
        let err = result.err().unwrap();
        assert!(matches!(err, PipelineError::InvalidIdentifier { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_end_to_end_sqlite_batches() {
        let dir = tempfile::tempdir().unwrap();
        let url = sqlite_url(&dir);
        let pipeline = LogPipeline::new(fast_options().with_batch_size(100));
        let handle = pipeline
            .start(StaticConnectionSource::new(url.clone()))
            .await
            .unwrap();

        let emitter = handle.emitter();
        let producers: Vec<_> = (0..5)
            .map(|p| {
                let emitter = emitter.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        emitter.log(LogLevel::Information, format!("producer-{}", p), i.to_string());
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while handle.stats().records_committed < 250 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stats = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stats.records_committed, 250);
        assert_eq!(stats.batches_committed, 3);
        assert_eq!(stats.failed_attempts, 0);

        let sink = SqlSink::new(SinkTarget::default());
        let logs = sink.recent_logs(&url, 1000).await.unwrap();
        assert_eq!(logs.len(), 250);
    }

    #[tokio::test]
    async fn test_sink_outage_is_retried_without_loss() {
        let dir = tempfile::tempdir().unwrap();
        let good_url = sqlite_url(&dir);
        let bad_url = format!(
            "sqlite://{}",
            dir.path().join("missing").join("nowhere.db").display()
        );

        let current = Arc::new(Mutex::new(good_url.clone()));
        let shared = current.clone();
        let source = FnConnectionSource::new(move || Some(shared.lock().unwrap().clone()));

        let handle = LogPipeline::new(fast_options())
            .start(source)
            .await
            .unwrap();

        // Sink goes away after provisioning
        *current.lock().unwrap() = bad_url;
        let emitter = handle.emitter();
        for i in 0..50 {
            emitter.emit(LogRecord::new(LogLevel::Warning, "outage", i.to_string()));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.stats().failed_attempts == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(handle.stats().failed_attempts >= 1);

        // Sink comes back
        *current.lock().unwrap() = good_url.clone();
        let deadline = Instant::now() + Duration::from_secs(3);
        while handle.stats().records_committed < 50 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stats = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stats.records_committed, 50);

        let sink = SqlSink::new(SinkTarget::default());
        let mut messages: Vec<i64> = sink
            .recent_logs(&good_url, 1000)
            .await
            .unwrap()
            .into_iter()
            .map(|log| log.message.unwrap().parse().unwrap())
            .collect();
        messages.sort();
        assert_eq!(messages, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_records() {
        let dir = tempfile::tempdir().unwrap();
        let url = sqlite_url(&dir);
        let options = fast_options().with_flush_interval(Duration::from_secs(60));
        let handle = LogPipeline::new(options)
            .start(StaticConnectionSource::new(url.clone()))
            .await
            .unwrap();

        handle.emitter().log(LogLevel::Information, "exit", "last words");
        let stats = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stats.records_committed, 1);

        let logs = SqlSink::new(SinkTarget::default())
            .recent_logs(&url, 10)
            .await
            .unwrap();
        assert_eq!(logs[0].message.as_deref(), Some("last words"));
    }

    #[test]
    fn test_default_options() {
        let options = SinkOptions::default();
        assert_eq!(options.schema_name, "logging");
        assert_eq!(options.table_name, "system_logs");
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.flush_interval, Duration::from_secs(5));
        assert_eq!(options.retry_cooldown, Duration::from_secs(5));
        assert_eq!(options.attempt_timeout, Duration::from_secs(30));
        assert_eq!(options.buffer_capacity, BufferCapacity::Unbounded);
    }
}
