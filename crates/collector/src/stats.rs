//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters covering the whole ingestion path, from the broker
/// callback through the batching writer.
#[derive(Debug, Default)]
pub struct CollectorStats {
    /// Messages delivered by the broker to the receive callback.
    pub received: AtomicU64,
    /// Messages accepted into the ingest ring.
    pub queued: AtomicU64,
    /// Messages discarded because the ring was full.
    pub dropped_on_ring_full: AtomicU64,
    /// Messages discarded because shutdown drained out before the workers.
    pub dropped_on_shutdown: AtomicU64,
    /// Payloads successfully shaped into points.
    pub decoded: AtomicU64,
    /// Payloads that failed to parse or lacked a device identity.
    pub decode_errors: AtomicU64,
    /// Points confirmed written by the store.
    pub points_written: AtomicU64,
    /// Individual retry attempts made by the batching writer.
    pub write_retries: AtomicU64,
    /// Batches abandoned (retries exhausted or non-retriable error).
    pub write_failures: AtomicU64,
}

// All methods use `Ordering::Relaxed` because these are purely statistical
// counters:
//
// 1. No control flow dependencies - no code path depends on these values
//    being "up to date"
// 2. Eventual visibility is acceptable - slightly stale reads are fine for
//    observability; exact totals are only meaningful at quiescence
// 3. No happens-before relationships needed - unlike the ring itself, these
//    don't guard any other data or coordinate producer-consumer handoff
impl CollectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn dropped_on_ring_full(&self) -> u64 {
        self.dropped_on_ring_full.load(Ordering::Relaxed)
    }

    pub fn dropped_on_shutdown(&self) -> u64 {
        self.dropped_on_shutdown.load(Ordering::Relaxed)
    }

    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn points_written(&self) -> u64 {
        self.points_written.load(Ordering::Relaxed)
    }

    pub fn write_retries(&self) -> u64 {
        self.write_retries.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
