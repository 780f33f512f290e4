//! # Log Buffer Module
//!
//! A multi-producer, single-consumer queue that decouples log producers from the
//! batch processor. Producers call [`LogBuffer::push`], which never blocks and never
//! fails visibly. The processor is the only reader.
//!
//! ## Capacity
//!
//! The buffer is unbounded by default: producers never wait for the sink, at the cost
//! of memory growth during long sink outages. A [`BufferCapacity::Bounded`] ceiling
//! rejects new records once the ceiling is reached and counts them in [`LogBuffer::dropped`].
//!
//! ## Ordering
//!
//! FIFO per producer, and globally FIFO for the consumer relative to channel arrival.

use crate::record::LogRecord;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio::time::Instant;
use tracing::warn;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// How many undrained records the buffer may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferCapacity {
    #[default]
    Unbounded,
    /// Reject new records while `depth >= n`
    Bounded(usize),
}

impl BufferCapacity {
    /// `0` means unbounded, matching the `LOGVAULT_BUFFER_CAPACITY` convention
    pub fn from_limit(limit: usize) -> Self {
        if limit == 0 {
            BufferCapacity::Unbounded
        } else {
            BufferCapacity::Bounded(limit)
        }
    }
}

/// Shared queue between record producers and the batch processor
pub struct LogBuffer {
    sender: mpsc::UnboundedSender<LogRecord>,
    receiver: Mutex<mpsc::UnboundedReceiver<LogRecord>>,
    capacity: BufferCapacity,
    depth: AtomicUsize,
    dropped: AtomicU64,
    overflowing: AtomicBool,
}

/// Exclusive read access to the buffer, held by the single consumer
pub struct LogReader<'a> {
    receiver: MutexGuard<'a, mpsc::UnboundedReceiver<LogRecord>>,
    buffer: &'a LogBuffer,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

impl LogBuffer {
    pub fn new(capacity: BufferCapacity) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            capacity,
            depth: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            overflowing: AtomicBool::new(false),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(BufferCapacity::Unbounded)
    }

    /// Enqueue a record without waiting
    pub fn push(&self, record: LogRecord) {
        match self.capacity {
            BufferCapacity::Unbounded => {
                self.depth.fetch_add(1, Ordering::AcqRel);
            }
            BufferCapacity::Bounded(max) => {
                let reserved = self
                    .depth
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                        (depth < max).then_some(depth + 1)
                    });
                if reserved.is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    // Only the first rejected record of an overflow episode logs
                    if !self.overflowing.swap(true, Ordering::AcqRel) {
                        warn!(
                            capacity = max,
                            "Log buffer is full, rejecting new records until the sink catches up"
                        );
                    }
                    return;
                }
            }
        }

        // The receiver lives as long as the buffer, so the channel is never closed
        if self.sender.send(record).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Acquire the single consumer handle, waiting if another reader holds it
    pub async fn reader(&self) -> LogReader<'_> {
        LogReader {
            receiver: self.receiver.lock().await,
            buffer: self,
        }
    }

    /// Records pushed but not yet drained
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Records rejected by the capacity ceiling
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> BufferCapacity {
        self.capacity
    }

    fn mark_drained(&self) {
        let previous = self.depth.fetch_sub(1, Ordering::AcqRel);
        if let BufferCapacity::Bounded(max) = self.capacity {
            if previous <= max {
                self.overflowing.store(false, Ordering::Release);
            }
        }
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl LogReader<'_> {
    /// Wait for the next record, giving up at `deadline`
    ///
    /// Cancel-safe: dropping the future never loses a record.
    pub async fn next_before(&mut self, deadline: Instant) -> Option<LogRecord> {
        match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
            Ok(Some(record)) => {
                self.buffer.mark_drained();
                Some(record)
            }
            Ok(None) | Err(_) => None,
        }
    }

    /// Take the next record only if one is already queued
    pub fn try_next(&mut self) -> Option<LogRecord> {
        let record = self.receiver.try_recv().ok()?;
        self.buffer.mark_drained();
        Some(record)
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::time::Duration;

    fn record(category: &str, message: String) -> LogRecord {
        LogRecord::new(LogLevel::Information, category, message)
    }

    #[tokio::test]
    async fn test_concurrent_pushes_drain_exactly_once() {
        let buffer = Arc::new(LogBuffer::unbounded());
        let producers = 8;
        let per_producer = 500;

        let mut handles = Vec::new();
        for p in 0..producers {
            let buffer = buffer.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..per_producer {
                    buffer.push(record(&format!("p{}", p), format!("{}-{}", p, i)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.depth(), producers * per_producer);

        let mut reader = buffer.reader().await;
        let mut seen = HashSet::new();
        let mut last_per_producer = vec![-1i64; producers];
        while let Some(r) = reader.try_next() {
            assert!(seen.insert(r.message().to_string()), "duplicate {}", r.message());
            let (p, i) = r.message().split_once('-').unwrap();
            let (p, i): (usize, i64) = (p.parse().unwrap(), i.parse().unwrap());
            assert!(i > last_per_producer[p], "producer order violated");
            last_per_producer[p] = i;
        }

        assert_eq!(seen.len(), producers * per_producer);
        assert_eq!(buffer.depth(), 0);
    }

    #[tokio::test]
    async fn test_next_before_returns_none_at_deadline() {
        let buffer = LogBuffer::unbounded();
        let mut reader = buffer.reader().await;

        let started = Instant::now();
        let next = reader
            .next_before(Instant::now() + Duration::from_millis(50))
            .await;
        assert!(next.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_next_before_wakes_on_push() {
        let buffer = Arc::new(LogBuffer::unbounded());
        let producer = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(record("late", "hello".to_string()));
        });

        let mut reader = buffer.reader().await;
        let next = reader
            .next_before(Instant::now() + Duration::from_secs(5))
            .await;
        assert_eq!(next.map(|r| r.message().to_string()), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_bounded_buffer_rejects_overflow() {
        let buffer = LogBuffer::new(BufferCapacity::Bounded(3));
        for i in 0..5 {
            buffer.push(record("bounded", i.to_string()));
        }
        assert_eq!(buffer.depth(), 3);
        assert_eq!(buffer.dropped(), 2);

        let mut reader = buffer.reader().await;
        assert_eq!(reader.try_next().unwrap().message(), "0");
        drop(reader);

        // Room for one more after draining one
        buffer.push(record("bounded", "5".to_string()));
        buffer.push(record("bounded", "6".to_string()));
        assert_eq!(buffer.depth(), 3);
        assert_eq!(buffer.dropped(), 3);
    }

    #[tokio::test]
    async fn test_single_reader_is_exclusive() {
        let buffer = LogBuffer::unbounded();
        let _first = buffer.reader().await;

        let second = tokio::time::timeout(Duration::from_millis(50), buffer.reader()).await;
        assert!(second.is_err(), "a second reader must wait for the first");
    }

    #[test]
    fn test_capacity_from_limit() {
        assert_eq!(BufferCapacity::from_limit(0), BufferCapacity::Unbounded);
        assert_eq!(BufferCapacity::from_limit(10), BufferCapacity::Bounded(10));
    }
}
