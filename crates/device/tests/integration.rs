//! Produce / outage / replay accounting, driven through the publish seam
//! with a controllable in-memory sink.

use fleet_device::{
    publish_or_queue, replay_outbox, ConnectionState, PublishError, PublishSink, SampleSource,
    TickOutcome,
};
use fleet_outbox::Outbox;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Sink with a switchable "network": publishes fail while it is down.
#[derive(Default)]
struct SwitchableSink {
    up: AtomicBool,
    handed_off: Mutex<Vec<Vec<u8>>>,
}

impl SwitchableSink {
    fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
            handed_off: Mutex::new(Vec::new()),
        }
    }

    fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    fn handed_off_count(&self) -> usize {
        self.handed_off.lock().unwrap().len()
    }

    fn accept(&self, payload: Vec<u8>) -> Result<(), PublishError> {
        if self.up.load(Ordering::SeqCst) {
            self.handed_off.lock().unwrap().push(payload);
            Ok(())
        } else {
            Err(PublishError::NotConnected)
        }
    }
}

impl PublishSink for SwitchableSink {
    fn try_publish(&self, _topic: &str, payload: &[u8], _qos: u8) -> Result<(), PublishError> {
        self.accept(payload.to_vec())
    }

    async fn publish(&self, _topic: &str, payload: Vec<u8>, _qos: u8) -> Result<(), PublishError> {
        self.accept(payload)
    }
}

fn tick(
    sink: &SwitchableSink,
    outbox: &Outbox,
    source: &mut SampleSource,
    state: ConnectionState,
) -> TickOutcome {
    let sample = source.next_sample();
    let payload = sample.to_bytes().unwrap();
    let (outcome, append) = publish_or_queue(sink, outbox, state, "device/data/veh_001", &payload);
    assert!(append.is_ok());
    outcome
}

#[tokio::test]
async fn every_sample_is_handed_off_or_queued() {
    let sink = SwitchableSink::new(true);
    let outbox = Outbox::in_memory(10_000).unwrap();
    let mut source = SampleSource::with_rng("veh_001", StdRng::seed_from_u64(1));

    let mut produced = 0u64;
    let mut handed_off = 0u64;

    // Steady state: everything goes direct.
    for _ in 0..50 {
        produced += 1;
        if tick(&sink, &outbox, &mut source, ConnectionState::Connected) == TickOutcome::Direct {
            handed_off += 1;
        }
    }

    assert_eq!(handed_off, produced - outbox.size().unwrap() as u64);
    assert_eq!(outbox.size().unwrap(), 0);
}

#[tokio::test]
async fn outage_queues_then_replay_accounts_for_everything() {
    let sink = SwitchableSink::new(true);
    let outbox = Outbox::in_memory(10_000).unwrap();
    let mut source = SampleSource::with_rng("veh_001", StdRng::seed_from_u64(2));

    // 20 samples while connected
    for _ in 0..20 {
        assert_eq!(
            tick(&sink, &outbox, &mut source, ConnectionState::Connected),
            TickOutcome::Direct
        );
    }

    // Outage: 300 samples queue up (like five minutes at 1 Hz)
    sink.set_up(false);
    for _ in 0..300 {
        assert_eq!(
            tick(&sink, &outbox, &mut source, ConnectionState::Disconnected),
            TickOutcome::Queued
        );
    }
    assert_eq!(outbox.size().unwrap(), 300);

    // Reconnect and replay
    sink.set_up(true);
    let outcome = replay_outbox(&sink, &outbox).await.unwrap();

    assert!(outcome.drained);
    assert_eq!(outcome.replayed, 300);
    assert_eq!(outbox.size().unwrap(), 0);
    // Total handoffs equal produced samples minus evictions (none here)
    assert_eq!(sink.handed_off_count(), 320);
    assert_eq!(outbox.evicted(), 0);
}

#[tokio::test]
async fn capacity_eviction_bounds_the_replay() {
    // Small cap stands in for a multi-hour outage at 1 Hz
    let cap = 50usize;
    let sink = SwitchableSink::new(false);
    let outbox = Outbox::in_memory(cap).unwrap();
    let mut source = SampleSource::with_rng("veh_001", StdRng::seed_from_u64(3));

    let produced = 180u64;
    for _ in 0..produced {
        tick(&sink, &outbox, &mut source, ConnectionState::Disconnected);
    }

    // Bound held throughout, overflow went to drop-oldest
    assert_eq!(outbox.size().unwrap(), cap);
    assert_eq!(outbox.evicted(), produced - cap as u64);

    sink.set_up(true);
    let outcome = replay_outbox(&sink, &outbox).await.unwrap();

    assert!(outcome.drained);
    assert_eq!(outcome.replayed, cap as u64);
    assert_eq!(sink.handed_off_count(), cap);
}

#[tokio::test]
async fn interrupted_outage_recovers_across_two_replays() {
    let sink = SwitchableSink::new(false);
    let outbox = Outbox::in_memory(1_000).unwrap();
    let mut source = SampleSource::with_rng("veh_001", StdRng::seed_from_u64(4));

    for _ in 0..150 {
        tick(&sink, &outbox, &mut source, ConnectionState::Disconnected);
    }

    // First reconnect fails immediately: nothing may be lost
    let outcome = replay_outbox(&sink, &outbox).await.unwrap();
    assert_eq!(outcome.replayed, 0);
    assert!(!outcome.drained);
    assert_eq!(outbox.size().unwrap(), 150);

    // Second reconnect drains
    sink.set_up(true);
    let outcome = replay_outbox(&sink, &outbox).await.unwrap();
    assert!(outcome.drained);
    assert_eq!(outcome.replayed, 150);
    assert_eq!(sink.handed_off_count(), 150);
}
