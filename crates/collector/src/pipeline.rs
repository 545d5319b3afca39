//! Worker pool between the ingest ring and the batching writer.
//!
//! Workers are plain tokio tasks sharing the ring through its MPMC
//! contract: take with a 1 s timeout, shape, hand the point to the writer.
//! On shutdown each worker stops taking new items, then drains whatever is
//! still queued until the ring is empty or the grace period elapses;
//! anything left after that is counted as dropped.

use crate::ring::{IngestRing, RawMessage};
use crate::shaper::{shape_point, ShapeError};
use crate::stats::CollectorStats;
use crate::status::DeviceStatusTracker;
use crate::writer::{BatchingWriter, PointSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

const TAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// How often the decoded-message progress line is emitted.
const PROGRESS_EVERY: u64 = 100;

/// Shapes one raw message and forwards the point to the writer.
async fn process_message<S: PointSink>(
    msg: RawMessage,
    writer: &BatchingWriter<S>,
    status: &DeviceStatusTracker,
    stats: &CollectorStats,
) {
    match shape_point(&msg.payload, msg.collector_receive_time) {
        Ok(point) => {
            CollectorStats::incr(&stats.decoded);
            if let Some(device_id) = point.get_tag("device_id") {
                status.update(device_id);
            }
            writer.write(point).await;

            let decoded = stats.decoded();
            if decoded % PROGRESS_EVERY == 0 {
                info!(decoded, "processed messages");
            }
        }
        Err(e @ ShapeError::Decode(_)) => {
            CollectorStats::incr(&stats.decode_errors);
            debug!(topic = %msg.topic, error = %e, "discarding malformed payload");
        }
        Err(e @ ShapeError::MissingIdentity) => {
            CollectorStats::incr(&stats.decode_errors);
            debug!(topic = %msg.topic, error = %e, "discarding payload without device_id");
        }
    }
}

async fn worker_loop<S: PointSink>(
    worker_id: usize,
    ring: IngestRing,
    writer: Arc<BatchingWriter<S>>,
    status: Arc<DeviceStatusTracker>,
    stats: Arc<CollectorStats>,
    shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
) {
    debug!(worker_id, "worker started");

    while !*shutdown_rx.borrow() {
        if let Some(msg) = ring.take(TAKE_TIMEOUT).await {
            process_message(msg, &writer, &status, &stats).await;
        }
    }

    // Drain phase: no new blocking takes, finish what is already queued.
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match ring.try_take() {
            Some(msg) => process_message(msg, &writer, &status, &stats).await,
            None => break,
        }
    }

    debug!(worker_id, "worker stopped");
}

/// Spawns the worker pool onto `tasks`.
#[allow(clippy::too_many_arguments)]
pub fn spawn_workers<S: PointSink + 'static>(
    worker_threads: usize,
    ring: &IngestRing,
    writer: &Arc<BatchingWriter<S>>,
    status: &Arc<DeviceStatusTracker>,
    stats: &Arc<CollectorStats>,
    shutdown_rx: &watch::Receiver<bool>,
    grace: Duration,
    tasks: &mut JoinSet<()>,
) {
    for worker_id in 0..worker_threads {
        tasks.spawn(worker_loop(
            worker_id,
            ring.clone(),
            Arc::clone(writer),
            Arc::clone(status),
            Arc::clone(stats),
            shutdown_rx.clone(),
            grace,
        ));
    }
}

/// Spawns the ticker that drives the writer's time-based flushes.
pub fn spawn_flush_ticker<S: PointSink + 'static>(
    writer: &Arc<BatchingWriter<S>>,
    shutdown_rx: &watch::Receiver<bool>,
    tasks: &mut JoinSet<()>,
) {
    let writer = Arc::clone(writer);
    let mut shutdown_rx = shutdown_rx.clone();
    tasks.spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = tick.tick() => writer.flush_if_due().await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::WriterConfig;
    use crate::point::Point;
    use crate::store::StoreError;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CountingSink {
        points: StdMutex<Vec<Point>>,
    }

    impl PointSink for Arc<CountingSink> {
        async fn write_batch(&self, batch: Vec<Point>) -> Result<(), StoreError> {
            self.points.lock().unwrap().extend(batch);
            Ok(())
        }
    }

    fn payload(device: &str, n: usize) -> RawMessage {
        RawMessage {
            topic: format!("device/data/{device}"),
            payload: format!(r#"{{"device_id": "{device}", "speed": {n}.0}}"#).into_bytes(),
            collector_receive_time: n as f64,
        }
    }

    fn writer_for(
        sink: Arc<CountingSink>,
        stats: Arc<CollectorStats>,
    ) -> Arc<BatchingWriter<Arc<CountingSink>>> {
        Arc::new(BatchingWriter::new(
            sink,
            WriterConfig {
                batch_size: 50,
                flush_interval: Duration::from_millis(20),
                max_retries: 0,
                retry_interval: Duration::from_millis(1),
                max_retry_delay: Duration::from_millis(1),
                retry_jitter: Duration::from_millis(1),
            },
            stats,
        ))
    }

    #[tokio::test]
    async fn workers_drain_ring_into_writer() {
        let ring = IngestRing::new(1000);
        let stats = Arc::new(CollectorStats::new());
        let status = Arc::new(DeviceStatusTracker::default());
        let sink = Arc::new(CountingSink::default());
        let writer = writer_for(Arc::clone(&sink), Arc::clone(&stats));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for i in 0..200 {
            ring.offer(payload("veh_001", i)).unwrap();
        }

        let mut tasks = JoinSet::new();
        spawn_workers(
            4,
            &ring,
            &writer,
            &status,
            &stats,
            &shutdown_rx,
            Duration::from_secs(1),
            &mut tasks,
        );

        // Let the pool catch up, then stop it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        while tasks.join_next().await.is_some() {}
        writer.close().await;

        assert_eq!(stats.decoded(), 200);
        assert_eq!(stats.decode_errors(), 0);
        assert_eq!(sink.points.lock().unwrap().len(), 200);
        assert!(ring.is_empty());
        assert_eq!(status.status_of("veh_001").unwrap().message_count, 200);
    }

    #[tokio::test]
    async fn malformed_payloads_are_counted_not_fatal() {
        let ring = IngestRing::new(100);
        let stats = Arc::new(CollectorStats::new());
        let status = Arc::new(DeviceStatusTracker::default());
        let sink = Arc::new(CountingSink::default());
        let writer = writer_for(Arc::clone(&sink), Arc::clone(&stats));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        ring.offer(RawMessage {
            topic: "device/data/x".into(),
            payload: b"not json".to_vec(),
            collector_receive_time: 0.0,
        })
        .unwrap();
        ring.offer(RawMessage {
            topic: "device/data/x".into(),
            payload: br#"{"speed": 1.0}"#.to_vec(),
            collector_receive_time: 0.0,
        })
        .unwrap();
        ring.offer(payload("veh_001", 1)).unwrap();

        let mut tasks = JoinSet::new();
        spawn_workers(
            2,
            &ring,
            &writer,
            &status,
            &stats,
            &shutdown_rx,
            Duration::from_secs(1),
            &mut tasks,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        while tasks.join_next().await.is_some() {}
        writer.close().await;

        assert_eq!(stats.decode_errors(), 2);
        assert_eq!(stats.decoded(), 1);
        assert_eq!(sink.points.lock().unwrap().len(), 1);
    }
}
