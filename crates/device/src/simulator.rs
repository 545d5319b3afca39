//! Device simulator: produces samples on a fixed cadence, publishes them
//! directly while connected and falls back to the durable outbox otherwise,
//! replaying the backlog after every reconnect.

use crate::client::{
    publish_or_queue, replay_outbox, ConnectionState, PublishSink, TickOutcome,
};
use crate::config::DeviceConfig;
use crate::mqtt::{connection_task, mqtt_options, MqttSink, TransportSetupError};
use crate::sample::SampleSource;
use fleet_outbox::{Outbox, OutboxError};
use rumqttc::AsyncClient;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Capacity of the MQTT client's request channel. Small on purpose: when
/// the connection is gone the channel fills within a few ticks and the
/// outbox takes over.
const MQTT_CHANNEL_CAPACITY: usize = 10;

/// Failures that prevent a device from launching at all.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error(transparent)]
    Transport(#[from] TransportSetupError),
}

/// Counters a running device exposes to the harness.
#[derive(Debug, Default)]
struct DeviceCounters {
    produced: AtomicU64,
    handed_off: AtomicU64,
    outbox_io_failures: AtomicU64,
}

/// Handle to a launched device.
///
/// The outbox reference is read-only from here (queue depth sampling); the
/// device task remains the only writer.
pub struct DeviceHandle {
    device_id: String,
    outbox: Arc<Outbox>,
    counters: Arc<DeviceCounters>,
    state_rx: watch::Receiver<ConnectionState>,
    link_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current outbox depth; 0 if the store cannot be read.
    pub fn outbox_size(&self) -> usize {
        self.outbox.size().unwrap_or(0)
    }

    /// Records lost to drop-oldest eviction.
    pub fn outbox_evicted(&self) -> u64 {
        self.outbox.evicted()
    }

    pub fn outbox_capacity(&self) -> usize {
        self.outbox.max_capacity()
    }

    /// Samples produced since launch.
    pub fn produced(&self) -> u64 {
        self.counters.produced.load(Ordering::Relaxed)
    }

    /// Messages handed to the broker (direct or replayed).
    pub fn handed_off(&self) -> u64 {
        self.counters.handed_off.load(Ordering::Relaxed)
    }

    pub fn outbox_io_failures(&self) -> u64 {
        self.counters.outbox_io_failures.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Deterministic network severing for the harness: while down, the
    /// device stops talking to the broker entirely.
    pub fn set_link(&self, up: bool) {
        let _ = self.link_tx.send(up);
    }

    /// Stops the device tasks. Pending outbox records stay on disk for the
    /// next launch.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        while self.tasks.join_next().await.is_some() {}
        info!(
            device_id = %self.device_id,
            produced = self.produced(),
            handed_off = self.handed_off(),
            queued = self.outbox_size(),
            "device stopped"
        );
    }
}

/// Launches one device: its outbox, MQTT session and publish loop.
pub fn launch(config: DeviceConfig) -> Result<DeviceHandle, DeviceError> {
    let outbox = Arc::new(Outbox::open(
        &config.queue_dir,
        &config.device_id,
        config.max_capacity,
    )?);
    let options = mqtt_options(&config)?;

    let (client, eventloop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);
    let sink = MqttSink::new(client);

    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let state_tx = Arc::new(state_tx);
    let (link_tx, link_rx) = watch::channel(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let counters = Arc::new(DeviceCounters::default());

    let mut tasks = JoinSet::new();
    tasks.spawn(connection_task(
        eventloop,
        Arc::clone(&state_tx),
        link_rx,
        shutdown_rx.clone(),
        config.device_id.clone(),
    ));
    tasks.spawn(run_loop(
        config.clone(),
        sink,
        Arc::clone(&outbox),
        state_tx,
        state_rx.clone(),
        shutdown_rx,
        Arc::clone(&counters),
    ));

    info!(
        device_id = %config.device_id,
        interval = ?config.publish_interval,
        "device started"
    );

    Ok(DeviceHandle {
        device_id: config.device_id,
        outbox,
        counters,
        state_rx,
        link_tx,
        shutdown_tx,
        tasks,
    })
}

fn spawn_replay<S: PublishSink + Clone + Send + 'static>(
    sink: &S,
    outbox: &Arc<Outbox>,
    state_tx: &Arc<watch::Sender<ConnectionState>>,
    counters: &Arc<DeviceCounters>,
    device_id: &str,
) -> JoinHandle<()> {
    let _ = state_tx.send(ConnectionState::ReplayingOutbox);
    let sink = sink.clone();
    let outbox = Arc::clone(outbox);
    let state_tx = Arc::clone(state_tx);
    let counters = Arc::clone(counters);
    let device_id = device_id.to_string();

    tokio::spawn(async move {
        match replay_outbox(&sink, &outbox).await {
            Ok(outcome) => {
                counters
                    .handed_off
                    .fetch_add(outcome.replayed, Ordering::Relaxed);
                if outcome.drained {
                    info!(%device_id, replayed = outcome.replayed, "outbox drained");
                } else {
                    warn!(
                        %device_id,
                        replayed = outcome.replayed,
                        "replay interrupted; remaining records kept"
                    );
                }
                // Back to Connected unless the connection moved on; an
                // interrupted replay with a live session restarts from the
                // publish loop.
                state_tx.send_if_modified(|s| {
                    if *s == ConnectionState::ReplayingOutbox {
                        *s = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => {
                warn!(%device_id, error = %e, "replay aborted on outbox error");
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<S: PublishSink + Clone + Send + 'static>(
    config: DeviceConfig,
    sink: S,
    outbox: Arc<Outbox>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    mut state_rx: watch::Receiver<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
    counters: Arc<DeviceCounters>,
) {
    let topic = config.topic();
    let mut source = SampleSource::new(&config.device_id);
    let mut tick = tokio::time::interval(config.publish_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut replay: Option<JoinHandle<()>> = None;

    loop {
        let replaying = replay.as_ref().is_some_and(|h| !h.is_finished());

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                let sample = source.next_sample();
                counters.produced.fetch_add(1, Ordering::Relaxed);
                let payload = match sample.to_bytes() {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(device_id = %config.device_id, error = %e, "sample serialization failed");
                        continue;
                    }
                };

                let current = *state_rx.borrow();

                // A backlog left behind by an interrupted replay restarts
                // here once the connection is healthy again, before this
                // sample is routed, so new data never jumps the backlog.
                let mut replaying = replaying;
                if current == ConnectionState::Connected
                    && !replaying
                    && outbox.size().unwrap_or(0) > 0
                {
                    replay = Some(spawn_replay(
                        &sink,
                        &outbox,
                        &state_tx,
                        &counters,
                        &config.device_id,
                    ));
                    replaying = true;
                }

                // Direct publishes pause while a replay is in flight so
                // replayed records keep their ordering ahead of new data.
                let effective = if replaying && current == ConnectionState::Connected {
                    ConnectionState::ReplayingOutbox
                } else {
                    current
                };

                let (outcome, append) =
                    publish_or_queue(&sink, &outbox, effective, &topic, &payload);
                match outcome {
                    TickOutcome::Direct => {
                        counters.handed_off.fetch_add(1, Ordering::Relaxed);
                    }
                    TickOutcome::QueuedAfterFailure => {
                        let _ = state_tx.send(ConnectionState::Disconnected);
                    }
                    TickOutcome::Queued => {}
                }
                if append.is_err() {
                    counters.outbox_io_failures.fetch_add(1, Ordering::Relaxed);
                }

                if let Ok(size) = outbox.size() {
                    if size > 0 && (size % 1000 == 0 || size > 5000) {
                        info!(device_id = %config.device_id, queue_size = size, "outbox backlog");
                    }
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow();
                if state == ConnectionState::Connected
                    && !replaying
                    && outbox.size().unwrap_or(0) > 0
                {
                    replay = Some(spawn_replay(
                        &sink,
                        &outbox,
                        &state_tx,
                        &counters,
                        &config.device_id,
                    ));
                }
            }
        }
    }

    if let Some(handle) = replay {
        // Replay acks only after handoff, so aborting mid-pass cannot lose
        // records; un-acked ones replay on the next launch.
        handle.abort();
    }
}
