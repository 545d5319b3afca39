//! Bounded in-memory ring between the broker callback and the worker pool.
//!
//! The producer side is the subscription receive path and must never block:
//! `offer` either enqueues immediately or reports `Full` so the caller can
//! count the drop and move on. Consumers are the pool workers, which take
//! with a short timeout so shutdown signals are observed promptly.

use std::time::Duration;
use thiserror::Error;

/// A raw broker delivery, stamped at receive time. Decoding happens later,
/// on a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Seconds since epoch when the callback observed the message.
    pub collector_receive_time: f64,
}

/// Errors from the producer side of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// The ring is at capacity; the message was dropped.
    #[error("ingest ring is full")]
    Full,
    /// All consumers are gone; the pipeline is shutting down.
    #[error("ingest ring is closed")]
    Closed,
}

/// Bounded multi-producer multi-consumer FIFO.
///
/// `len()` is an estimate under concurrency; exact only at quiescence.
#[derive(Clone)]
pub struct IngestRing {
    tx: flume::Sender<RawMessage>,
    rx: flume::Receiver<RawMessage>,
    capacity: usize,
}

impl IngestRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Non-blocking enqueue. Returns immediately with `RingError::Full`
    /// when at capacity (drop-newest).
    pub fn offer(&self, msg: RawMessage) -> Result<(), RingError> {
        self.tx.try_send(msg).map_err(|e| match e {
            flume::TrySendError::Full(_) => RingError::Full,
            flume::TrySendError::Disconnected(_) => RingError::Closed,
        })
    }

    /// Takes the next message, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout or when the ring is closed.
    pub async fn take(&self, timeout: Duration) -> Option<RawMessage> {
        match tokio::time::timeout(timeout, self.rx.recv_async()).await {
            Ok(Ok(msg)) => Some(msg),
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Non-blocking take, used while draining at shutdown.
    pub fn try_take(&self) -> Option<RawMessage> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> RawMessage {
        RawMessage {
            topic: "device/data/veh_001".into(),
            payload: format!("{n}").into_bytes(),
            collector_receive_time: n as f64,
        }
    }

    #[test]
    fn offer_full_ring_fails_immediately() {
        let ring = IngestRing::new(3);
        for i in 0..3 {
            ring.offer(msg(i)).unwrap();
        }

        assert_eq!(ring.offer(msg(3)), Err(RingError::Full));
        assert_eq!(ring.len(), 3);
    }

    #[tokio::test]
    async fn take_preserves_fifo_order() {
        let ring = IngestRing::new(10);
        for i in 0..5 {
            ring.offer(msg(i)).unwrap();
        }

        for i in 0..5 {
            let got = ring.take(Duration::from_millis(10)).await.unwrap();
            assert_eq!(got.payload, format!("{i}").into_bytes());
        }
    }

    #[tokio::test]
    async fn take_times_out_on_empty_ring() {
        let ring = IngestRing::new(4);
        let got = ring.take(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn multiple_consumers_share_the_ring() {
        let ring = IngestRing::new(100);
        for i in 0..100 {
            ring.offer(msg(i)).unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let ring = ring.clone();
            tasks.push(tokio::spawn(async move {
                let mut taken = 0usize;
                while ring.take(Duration::from_millis(10)).await.is_some() {
                    taken += 1;
                }
                taken
            }));
        }

        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, 100);
        assert!(ring.is_empty());
    }
}
