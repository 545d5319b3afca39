//! Device-side publish path: connection state, direct-or-queue decision and
//! ordered outbox replay.
//!
//! The broker seam is the [`PublishSink`] trait so the publish and replay
//! algorithms are testable without a broker; the production implementation
//! wraps the MQTT client (see [`crate::mqtt`]).

use fleet_outbox::{Outbox, OutboxError};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Connection lifecycle of one device session.
///
/// Any transport error from a non-`Disconnected` state returns to
/// `Disconnected` and schedules a reconnect with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReplayingOutbox,
}

/// Errors from handing a message to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// No broker connection right now.
    #[error("not connected to broker")]
    NotConnected,
    /// The client's outgoing request queue is full.
    #[error("publish queue is full")]
    QueueFull,
    /// Network-level failure; worth reconnecting and retrying.
    #[error("transport error: {0}")]
    Transport(String),
    /// Authentication / protocol failure; retrying will not help.
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl PublishError {
    /// Transient errors fall back to the outbox; fatal ones are surfaced.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Broker handoff seam.
///
/// `try_publish` must not block (used on the tick path); `publish` may wait
/// for queue space (used during replay, where backpressure is the throttle).
pub trait PublishSink: Send + Sync {
    fn try_publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), PublishError>;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: u8,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

/// What happened to one produced sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Handed directly to the broker.
    Direct,
    /// Queued because the device was not connected (or mid-replay).
    Queued,
    /// A direct attempt failed; the sample was queued and the connection
    /// should be treated as lost.
    QueuedAfterFailure,
}

/// Appends to the outbox, absorbing storage failures: the device keeps
/// running and the loss is logged and counted by the caller.
fn queue_message(outbox: &Outbox, topic: &str, payload: &[u8]) -> Result<(), OutboxError> {
    match outbox.append(topic, payload, 1) {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = %e, "outbox append failed; message lost");
            Err(e)
        }
    }
}

/// Publish decision for one produced sample.
///
/// Direct publish is only attempted when the session is `Connected` and not
/// mid-replay; everything else goes to the outbox.
pub fn publish_or_queue<S: PublishSink>(
    sink: &S,
    outbox: &Outbox,
    state: ConnectionState,
    topic: &str,
    payload: &[u8],
) -> (TickOutcome, Result<(), OutboxError>) {
    if state == ConnectionState::Connected {
        match sink.try_publish(topic, payload, 1) {
            Ok(()) => (TickOutcome::Direct, Ok(())),
            Err(e) => {
                warn!(error = %e, "direct publish failed, queueing");
                (
                    TickOutcome::QueuedAfterFailure,
                    queue_message(outbox, topic, payload),
                )
            }
        }
    } else {
        (TickOutcome::Queued, queue_message(outbox, topic, payload))
    }
}

/// Records replayed per peek batch.
const REPLAY_BATCH: usize = 100;
/// Yield cadence within a batch, to avoid saturating the broker.
const REPLAY_YIELD_EVERY: usize = 10;
const REPLAY_YIELD: Duration = Duration::from_millis(10);

/// Result of one replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Records successfully handed off (and acked).
    pub replayed: u64,
    /// Whether the outbox reached empty.
    pub drained: bool,
}

/// Replays the outbox in id order.
///
/// Records are published with their stored QoS; after each fully successful
/// batch the handed-off prefix is acked. On any publish failure the pass
/// stops, acking only what was handed off; the remaining records stay for
/// the next connect cycle. No record is ever acked before its handoff.
pub async fn replay_outbox<S: PublishSink>(
    sink: &S,
    outbox: &Outbox,
) -> Result<ReplayOutcome, OutboxError> {
    let mut replayed = 0u64;

    loop {
        let batch = outbox.peek_batch(REPLAY_BATCH)?;
        if batch.is_empty() {
            return Ok(ReplayOutcome {
                replayed,
                drained: true,
            });
        }

        let mut last_ok: Option<u64> = None;
        let mut failed = false;

        for (i, record) in batch.iter().enumerate() {
            match sink
                .publish(&record.topic, record.payload.clone(), record.qos)
                .await
            {
                Ok(()) => {
                    last_ok = Some(record.id);
                    replayed += 1;
                    if (i + 1) % REPLAY_YIELD_EVERY == 0 {
                        tokio::time::sleep(REPLAY_YIELD).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, record_id = record.id, "replay publish failed");
                    failed = true;
                    break;
                }
            }
        }

        if let Some(id) = last_ok {
            outbox.ack(id)?;
            debug!(up_to_id = id, "acked replayed records");
        }

        if failed {
            return Ok(ReplayOutcome {
                replayed,
                drained: false,
            });
        }
    }
}
