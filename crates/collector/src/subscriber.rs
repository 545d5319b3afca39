//! Broker subscription and the non-blocking receive path.
//!
//! One task owns the MQTT event loop. The receive path does no decoding:
//! it stamps the receive time and offers the raw payload to the ring. A
//! full ring drops the message (counted) and the loop moves on immediately.

use crate::config::CollectorConfig;
use crate::ring::{IngestRing, RawMessage, RingError};
use crate::stats::CollectorStats;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Primary subscription: every device publishes under its own id here.
pub const DEVICE_DATA_TOPIC: &str = "device/data/+";
/// Legacy speed-only topic, still accepted.
pub const LEGACY_SPEED_TOPIC: &str = "vehicle/speed/+";

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);

/// Builds the broker session options for the collector: persistent session,
/// 60 s keepalive, credential pass-through.
pub fn mqtt_options(config: &CollectorConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker_host.clone(),
        config.broker_port,
    );
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_session(false);
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user.clone(), pass.clone());
    }
    options
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The receive callback proper: count the delivery and offer it to the
/// ring without blocking. Returns `false` when the ring is closed and the
/// subscription loop should stop.
pub fn deliver(ring: &IngestRing, stats: &CollectorStats, msg: RawMessage) -> bool {
    CollectorStats::incr(&stats.received);
    match ring.offer(msg) {
        Ok(()) => {
            CollectorStats::incr(&stats.queued);
            true
        }
        Err(RingError::Full) => {
            CollectorStats::incr(&stats.dropped_on_ring_full);
            true
        }
        Err(RingError::Closed) => false,
    }
}

/// Spawns the subscription task onto `tasks`.
///
/// The task re-subscribes on every broker acknowledgment (subscriptions do
/// not survive a new session) and backs off exponentially between
/// reconnect attempts.
pub fn spawn_subscriber(
    client: AsyncClient,
    mut eventloop: EventLoop,
    ring: IngestRing,
    stats: Arc<CollectorStats>,
    mut shutdown_rx: watch::Receiver<bool>,
    tasks: &mut JoinSet<()>,
) {
    tasks.spawn(async move {
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("collector connected to broker");
                        reconnect_delay = INITIAL_RECONNECT_DELAY;
                        for topic in [DEVICE_DATA_TOPIC, LEGACY_SPEED_TOPIC] {
                            if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                                warn!(topic, error = %e, "subscribe request failed");
                            } else {
                                info!(topic, "subscribed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = RawMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                            collector_receive_time: epoch_seconds(),
                        };
                        if !deliver(&ring, &stats, msg) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, delay = ?reconnect_delay, "broker connection error");
                        tokio::select! {
                            _ = tokio::time::sleep(reconnect_delay) => {}
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                    }
                }
            }
        }

        debug!("subscriber task stopped");
    });
}
