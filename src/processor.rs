//! # Batch Processor Module
//!
//! The single consumer of the [`LogBuffer`]. Each cycle it fills a batch, persists it in
//! one sink transaction, and either clears it (commit) or keeps it for the next cycle
//! (failure).
//!
//! ## Cycle
//!
//! 1. **Fill**: wait for records until the batch holds `batch_size` records (size trigger)
//!    or `flush_interval` has passed since the cycle started (time trigger). A batch that
//!    still holds records from a failed attempt only tops up with records already queued.
//! 2. **Persist**: resolve the connection string fresh, then write the whole batch inside
//!    one transaction, bounded by `attempt_timeout`.
//! 3. **Commit or retain**: clear on success. On failure, log, sleep `retry_cooldown`, and
//!    retry the same records.
//!
//! ## Delivery
//!
//! Records already drained from the buffer are delivered at least once. Because the sink
//! write is transactional, a failed attempt leaves no rows behind, so a retried batch is
//! committed exactly once. The one exception is a commit that succeeds on the server after
//! the attempt timed out locally.
//!
//! ## Shutdown
//!
//! Shutdown interrupts the fill wait and the cooldown immediately. The processor then makes
//! a best-effort final flush of the retained batch plus everything queued at that moment,
//! one attempt per chunk, stopping at the first failure.

use crate::buffer::LogBuffer;
use crate::connection::{ConnectionSource, resolve};
use crate::database::LogSink;
use crate::error::PipelineError;
use crate::record::LogRecord;
use crate::shutdown::ShutdownListener;
use crate::worker::Worker;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shortest flush interval accepted, so an empty buffer is never polled in a tight loop
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Timing and sizing for the batch processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_cooldown: Duration,
    pub attempt_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            retry_cooldown: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Records drained from the buffer and not yet committed
#[derive(Debug)]
pub struct Batch {
    records: Vec<LogRecord>,
    capacity: usize,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    fn push(&mut self, record: LogRecord) {
        self.records.push(record);
    }

    /// Only called after a confirmed commit
    fn clear(&mut self) {
        self.records.clear();
    }
}

/// Counters describing processor progress
#[derive(Debug, Default)]
pub struct ProcessorStats {
    batches_committed: AtomicU64,
    records_committed: AtomicU64,
    failed_attempts: AtomicU64,
}

/// Point-in-time copy of [`ProcessorStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub batches_committed: u64,
    pub records_committed: u64,
    pub failed_attempts: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            records_committed: self.records_committed.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
        }
    }

    fn record_commit(&self, records: u64) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.records_committed.fetch_add(records, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drains the buffer into batches and persists them to the sink
pub struct BatchProcessor<C, S> {
    buffer: Arc<LogBuffer>,
    source: Arc<C>,
    sink: Arc<S>,
    config: ProcessorConfig,
    batch: Mutex<Batch>,
    stats: Arc<ProcessorStats>,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

impl<C: ConnectionSource, S: LogSink> BatchProcessor<C, S> {
    pub fn new(buffer: Arc<LogBuffer>, source: Arc<C>, sink: Arc<S>, config: ProcessorConfig) -> Self {
        let config = ProcessorConfig {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval.max(MIN_FLUSH_INTERVAL),
            ..config
        };
        Self {
            buffer,
            source,
            sink,
            config,
            batch: Mutex::new(Batch::new(config.batch_size)),
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        self.stats.clone()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Fill the batch from the buffer; returns `true` if shutdown interrupted the wait
    async fn fill(&self, batch: &mut Batch, shutdown: &mut ShutdownListener) -> bool {
        let mut reader = self.buffer.reader().await;

        if !batch.is_empty() {
            while !batch.is_full() {
                match reader.try_next() {
                    Some(record) => batch.push(record),
                    None => break,
                }
            }
            return shutdown.is_shutdown();
        }

        let deadline = Instant::now() + self.config.flush_interval;
        while !batch.is_full() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return true,
                next = reader.next_before(deadline) => match next {
                    Some(record) => batch.push(record),
                    None => break,
                },
            }
        }
        false
    }

    /// One persistence attempt: fresh connection string, one transaction, bounded time
    async fn persist(&self, records: &[LogRecord]) -> Result<u64, PipelineError> {
        let attempt = async {
            let connection_string = resolve(self.source.as_ref())
                .await
                .ok_or(PipelineError::ConnectionUnresolved)?;
            self.sink.write_batch(&connection_string, records).await
        };

        match tokio::time::timeout(self.config.attempt_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::AttemptTimedOut(self.config.attempt_timeout)),
        }
    }

    /// Persist the batch and update counters; the batch is cleared only on commit
    async fn flush(&self, batch: &mut Batch) -> Result<(), PipelineError> {
        let batch_id = Uuid::new_v4();
        match self.persist(batch.records()).await {
            Ok(written) => {
                debug!(%batch_id, records = batch.len(), written, "Committed log batch");
                self.stats.record_commit(batch.len() as u64);
                batch.clear();
                Ok(())
            }
            Err(e) => {
                self.stats.record_failure();
                Err(e)
            }
        }
    }

    /// Flush the retained batch and whatever is queued right now
    ///
    /// Returns the number of records left unpersisted.
    async fn final_flush(&self, batch: &mut Batch) -> usize {
        let mut reader = self.buffer.reader().await;
        // Records pushed after shutdown started are not chased
        let mut budget = self.buffer.depth();

        loop {
            while budget > 0 && !batch.is_full() {
                match reader.try_next() {
                    Some(record) => {
                        batch.push(record);
                        budget -= 1;
                    }
                    None => budget = 0,
                }
            }

            if batch.is_empty() {
                return 0;
            }

            if let Err(e) = self.flush(batch).await {
                let remaining = batch.len() + budget;
                warn!(
                    error = %e,
                    remaining,
                    "Final flush failed, buffered records were not persisted"
                );
                return remaining;
            }
        }
    }
}

impl<C: ConnectionSource, S: LogSink> Worker for BatchProcessor<C, S> {
    fn name(&self) -> &str {
        "batch-processor"
    }

    async fn run(&self, mut shutdown: ShutdownListener) -> Result<(), PipelineError> {
        info!(
            batch_size = self.config.batch_size,
            flush_interval = ?self.config.flush_interval,
            "Batch processor started"
        );

        let mut batch = self.batch.lock().await;
        if !batch.is_empty() {
            info!(records = batch.len(), "Resuming with retained batch");
        }

        loop {
            if self.fill(&mut batch, &mut shutdown).await {
                break;
            }
            if batch.is_empty() {
                continue;
            }

            if let Err(e) = self.flush(&mut batch).await {
                if e.is_fatal() {
                    // Retrying only helps once the connection source hands out a usable sink
                    error!(
                        severity = "critical",
                        error = %e,
                        records = batch.len(),
                        "Sink cannot accept logs, retrying in {:?}",
                        self.config.retry_cooldown
                    );
                } else {
                    error!(
                        error = %e,
                        records = batch.len(),
                        "Error flushing logs to sink, retrying in {:?}",
                        self.config.retry_cooldown
                    );
                }
                if shutdown.wait_or_shutdown(self.config.retry_cooldown).await {
                    break;
                }
            }
        }

        let unflushed = self.final_flush(&mut batch).await;
        info!(
            unflushed,
            committed = self.stats.snapshot().records_committed,
            "Batch processor stopped"
        );
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
