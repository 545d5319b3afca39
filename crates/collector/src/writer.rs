//! Batching writer with bounded retries.
//!
//! Workers hand points in one at a time; the writer aggregates them and
//! flushes when either the size threshold or the flush interval is reached,
//! whichever comes first. Retriable store errors are backed off with
//! exponential delay plus jitter; non-retriable errors abandon the batch.
//! Abandoned points are not spilled anywhere else: transport loss up to the
//! broker is already covered by the device-side outbox.

use crate::point::Point;
use crate::stats::CollectorStats;
use crate::store::{StoreClient, StoreError};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

/// Destination for shaped point batches.
///
/// The production sink is [`StoreClient`]; tests substitute in-memory
/// doubles. Uses native async-fn-in-trait; the writer is generic over the
/// sink so no boxing is needed.
pub trait PointSink: Send + Sync {
    fn write_batch(
        &self,
        batch: Vec<Point>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl PointSink for StoreClient {
    async fn write_batch(&self, batch: Vec<Point>) -> Result<(), StoreError> {
        let mut body = String::with_capacity(batch.len() * 128);
        for point in &batch {
            body.push_str(&point.to_line_protocol());
            body.push('\n');
        }
        self.write_lines(body).await
    }
}

impl<T: PointSink> PointSink for Arc<T> {
    async fn write_batch(&self, batch: Vec<Point>) -> Result<(), StoreError> {
        T::write_batch(self, batch).await
    }
}

/// Configuration for batching and retry behavior.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush when this many points are pending.
    pub batch_size: usize,
    /// Flush when the oldest pending point is this old.
    pub flush_interval: Duration,
    /// Retry attempts per batch after the initial submission.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_interval: Duration,
    /// Cap on the exponential backoff.
    pub max_retry_delay: Duration,
    /// Upper bound of the random jitter added to each retry delay.
    pub retry_jitter: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 250,
            flush_interval: Duration::from_millis(500),
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(30),
            retry_jitter: Duration::from_millis(250),
        }
    }
}

impl WriterConfig {
    /// Backoff delay for a given retry attempt (1-indexed), before jitter.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self
            .retry_interval
            .saturating_mul(2u32.saturating_pow(attempt - 1));
        exp.min(self.max_retry_delay)
    }
}

struct PendingBatch {
    points: Vec<Point>,
    last_flush: Instant,
}

/// Size-and-time triggered batcher in front of a [`PointSink`].
pub struct BatchingWriter<S: PointSink> {
    sink: S,
    config: WriterConfig,
    pending: Mutex<PendingBatch>,
    stats: Arc<CollectorStats>,
}

impl<S: PointSink> BatchingWriter<S> {
    pub fn new(sink: S, config: WriterConfig, stats: Arc<CollectorStats>) -> Self {
        Self {
            sink,
            config,
            pending: Mutex::new(PendingBatch {
                points: Vec::new(),
                last_flush: Instant::now(),
            }),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<CollectorStats> {
        &self.stats
    }

    /// Accepts one point; flushes inline when the size trigger fires.
    pub async fn write(&self, point: Point) {
        let batch = {
            let mut pending = self.pending.lock().await;
            pending.points.push(point);
            if pending.points.len() >= self.config.batch_size {
                pending.last_flush = Instant::now();
                Some(std::mem::take(&mut pending.points))
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            self.submit(batch).await;
        }
    }

    /// Flushes pending points if the flush interval has elapsed. Driven by
    /// the pipeline's ticker task.
    pub async fn flush_if_due(&self) {
        let batch = {
            let mut pending = self.pending.lock().await;
            if !pending.points.is_empty()
                && pending.last_flush.elapsed() >= self.config.flush_interval
            {
                pending.last_flush = Instant::now();
                Some(std::mem::take(&mut pending.points))
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            self.submit(batch).await;
        }
    }

    /// Forces out whatever is pending. Called once at shutdown.
    pub async fn close(&self) {
        let batch = {
            let mut pending = self.pending.lock().await;
            pending.last_flush = Instant::now();
            if pending.points.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut pending.points))
            }
        };

        if let Some(batch) = batch {
            self.submit(batch).await;
        }
    }

    /// Submits one batch with bounded retries.
    ///
    /// The batch is lost after `max_retries` retriable failures or on the
    /// first non-retriable one; either way the pipeline keeps running.
    async fn submit(&self, batch: Vec<Point>) {
        let count = batch.len() as u64;
        let max_attempts = self.config.max_retries + 1;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let base = self.config.delay_for_attempt(attempt);
                let jitter_cap = self.config.retry_jitter.as_millis() as u64;
                let jitter = if jitter_cap == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap))
                };
                CollectorStats::incr(&self.stats.write_retries);
                sleep(base + jitter).await;
            }

            match self.sink.write_batch(batch.clone()).await {
                Ok(()) => {
                    CollectorStats::add(&self.stats.points_written, count);
                    debug!(points = count, attempt, "batch written");
                    return;
                }
                Err(e) if !e.is_retriable() => {
                    error!(points = count, error = %e, "batch aborted (non-retriable)");
                    CollectorStats::incr(&self.stats.write_failures);
                    return;
                }
                Err(e) => {
                    warn!(points = count, attempt, error = %e, "batch write failed");
                }
            }
        }

        error!(
            points = count,
            attempts = max_attempts,
            "batch abandoned after retries"
        );
        CollectorStats::incr(&self.stats.write_failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::FieldValue;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    fn test_point(n: i64) -> Point {
        let mut point = Point::new("device_data");
        point.tag("device_id", format!("veh_{n:03}"));
        point.field("speed", FieldValue::Float(n as f64));
        point
    }

    fn fast_config(batch_size: usize) -> WriterConfig {
        WriterConfig {
            batch_size,
            flush_interval: Duration::from_millis(40),
            max_retries: 3,
            retry_interval: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(10),
            retry_jitter: Duration::from_millis(1),
        }
    }

    /// Records every batch it receives.
    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<Vec<Point>>>,
    }

    impl RecordingSink {
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    impl PointSink for &RecordingSink {
        async fn write_batch(&self, batch: Vec<Point>) -> Result<(), StoreError> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    /// Fails a configurable number of times before succeeding.
    struct FailingSink {
        failures_remaining: AtomicU32,
        error: fn() -> StoreError,
        attempts: AtomicU32,
    }

    impl FailingSink {
        fn new(fail_count: u32, error: fn() -> StoreError) -> Self {
            Self {
                failures_remaining: AtomicU32::new(fail_count),
                error,
                attempts: AtomicU32::new(0),
            }
        }
    }

    impl PointSink for &FailingSink {
        async fn write_batch(&self, _batch: Vec<Point>) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let remaining = self.failures_remaining.fetch_sub(1, Ordering::Relaxed);
            if remaining > 0 {
                Err((self.error)())
            } else {
                self.failures_remaining.store(0, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn transient() -> StoreError {
        StoreError::Unavailable {
            code: 503,
            body: String::new(),
        }
    }

    fn schema_conflict() -> StoreError {
        StoreError::SchemaConflict("speed is type float, not integer".into())
    }

    #[tokio::test]
    async fn size_trigger_flushes_full_batches() {
        let sink = RecordingSink::default();
        let writer = BatchingWriter::new(&sink, fast_config(5), Arc::new(CollectorStats::new()));

        for i in 0..12 {
            writer.write(test_point(i)).await;
        }

        assert_eq!(sink.batch_sizes(), vec![5, 5]);
        assert_eq!(writer.stats().points_written(), 10);

        writer.close().await;
        assert_eq!(sink.batch_sizes(), vec![5, 5, 2]);
        assert_eq!(writer.stats().points_written(), 12);
    }

    #[tokio::test]
    async fn time_trigger_flushes_partial_batches() {
        let sink = RecordingSink::default();
        let writer =
            BatchingWriter::new(&sink, fast_config(1000), Arc::new(CollectorStats::new()));

        writer.write(test_point(1)).await;
        writer.flush_if_due().await;
        assert!(sink.batch_sizes().is_empty(), "interval not elapsed yet");

        sleep(Duration::from_millis(60)).await;
        writer.flush_if_due().await;
        assert_eq!(sink.batch_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn retriable_failures_back_off_then_succeed() {
        let sink = FailingSink::new(2, transient);
        let stats = Arc::new(CollectorStats::new());
        let writer = BatchingWriter::new(&sink, fast_config(2), Arc::clone(&stats));

        writer.write(test_point(1)).await;
        writer.write(test_point(2)).await;

        assert_eq!(sink.attempts.load(Ordering::Relaxed), 3);
        assert_eq!(stats.write_retries(), 2);
        assert_eq!(stats.points_written(), 2);
        assert_eq!(stats.write_failures(), 0);
    }

    #[tokio::test]
    async fn batch_abandoned_after_max_retries() {
        let sink = FailingSink::new(10, transient);
        let stats = Arc::new(CollectorStats::new());
        let writer = BatchingWriter::new(&sink, fast_config(1), Arc::clone(&stats));

        writer.write(test_point(1)).await;

        // initial attempt + 3 retries
        assert_eq!(sink.attempts.load(Ordering::Relaxed), 4);
        assert_eq!(stats.write_retries(), 3);
        assert_eq!(stats.write_failures(), 1);
        assert_eq!(stats.points_written(), 0);
    }

    #[tokio::test]
    async fn schema_conflict_aborts_without_retry() {
        let sink = FailingSink::new(10, schema_conflict);
        let stats = Arc::new(CollectorStats::new());
        let writer = BatchingWriter::new(&sink, fast_config(1), Arc::clone(&stats));

        writer.write(test_point(1)).await;

        assert_eq!(sink.attempts.load(Ordering::Relaxed), 1);
        assert_eq!(stats.write_retries(), 0);
        assert_eq!(stats.write_failures(), 1);

        // The writer keeps accepting points afterwards
        let ok_sink = RecordingSink::default();
        let writer2 = BatchingWriter::new(&ok_sink, fast_config(1), Arc::clone(&stats));
        writer2.write(test_point(2)).await;
        assert_eq!(stats.points_written(), 1);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let config = WriterConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }
}
