//! In-memory sink with scripted failures, used to drive pipeline tests.

use super::{LogSink, ProvisionReport};
use crate::error::PipelineError;
use crate::record::LogRecord;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// One call to `write_batch`
#[derive(Debug, Clone)]
pub struct Attempt {
    pub at: Instant,
    pub connection_string: String,
    pub records: Vec<LogRecord>,
    pub succeeded: bool,
}

#[derive(Default)]
pub struct MemorySink {
    attempts: Mutex<Vec<Attempt>>,
    committed: Mutex<Vec<LogRecord>>,
    failures_remaining: AtomicUsize,
    fail_provisioning: AtomicBool,
    provision_calls: AtomicUsize,
    write_delay: Mutex<Option<Duration>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` write attempts
    pub fn fail_next_writes(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn fail_provisioning(&self) {
        self.fail_provisioning.store(true, Ordering::SeqCst);
    }

    /// Make every write sleep before completing
    pub fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn committed(&self) -> Vec<LogRecord> {
        self.committed.lock().unwrap().clone()
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }
}

impl LogSink for MemorySink {
    async fn provision(&self, connection_string: &str) -> Result<ProvisionReport, PipelineError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_provisioning.load(Ordering::SeqCst) {
            return Err(PipelineError::Provisioning(sqlx::Error::Protocol(
                "permission denied for CREATE SCHEMA".to_string(),
            )));
        }
        Ok(ProvisionReport {
            target: connection_string.to_string(),
            schema_created: false,
            table_created: false,
        })
    }

    async fn write_batch(
        &self,
        connection_string: &str,
        records: &[LogRecord],
    ) -> Result<u64, PipelineError> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        self.attempts.lock().unwrap().push(Attempt {
            at: Instant::now(),
            connection_string: connection_string.to_string(),
            records: records.to_vec(),
            succeeded: !fail,
        });

        if fail {
            return Err(PipelineError::Database(sqlx::Error::PoolTimedOut));
        }
        self.committed.lock().unwrap().extend_from_slice(records);
        Ok(records.len() as u64)
    }
}
