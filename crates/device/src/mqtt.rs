//! MQTT transport wiring for the device client.
//!
//! Builds the broker session options (persistent session, 60 s keepalive,
//! optional TLS, credential pass-through), adapts the MQTT client to the
//! [`PublishSink`] seam and runs the network event loop that tracks
//! connection state.

use crate::client::{ConnectionState, PublishError, PublishSink};
use crate::config::DeviceConfig;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const KEEPALIVE: Duration = Duration::from_secs(60);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);

/// Transport configuration failures, reported before any connect attempt.
#[derive(Debug, Error)]
pub enum TransportSetupError {
    /// TLS requires a trust root; for self-signed development brokers the
    /// broker certificate itself is pinned via `ca_certs`.
    #[error("use_tls requires ca_certs (pin the broker certificate for self-signed setups)")]
    MissingCaCerts,

    /// A certificate or key file could not be read.
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
}

fn read_pem(path: &std::path::Path) -> Result<Vec<u8>, TransportSetupError> {
    std::fs::read(path).map_err(|source| TransportSetupError::ReadFile {
        path: path.display().to_string(),
        source,
    })
}

/// Builds session options from the device configuration.
pub fn mqtt_options(config: &DeviceConfig) -> Result<MqttOptions, TransportSetupError> {
    let mut options = MqttOptions::new(
        config.client_id(),
        config.broker_host.clone(),
        config.broker_port,
    );
    options.set_keep_alive(KEEPALIVE);
    options.set_clean_session(false);

    let transport = &config.transport;
    if let (Some(user), Some(pass)) = (&transport.username, &transport.password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    if transport.use_tls {
        let ca_path = transport
            .ca_certs
            .as_ref()
            .ok_or(TransportSetupError::MissingCaCerts)?;
        let ca = read_pem(ca_path)?;
        let client_auth = match (&transport.certfile, &transport.keyfile) {
            (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
            _ => None,
        };
        if transport.tls_insecure {
            warn!(
                device_id = %config.device_id,
                "tls_insecure set: trusting the pinned broker certificate"
            );
        }
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }

    Ok(options)
}

fn qos_from(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// [`PublishSink`] over the MQTT client.
#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
}

impl MqttSink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl PublishSink for MqttSink {
    fn try_publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, qos_from(qos), false, payload.to_vec())
            .map_err(|e| match e {
                ClientError::TryRequest(_) => PublishError::QueueFull,
                other => PublishError::Transport(other.to_string()),
            })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<(), PublishError> {
        self.client
            .publish(topic, qos_from(qos), false, payload)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

async fn sleep_backoff(
    backoff: &mut Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(*backoff) => {}
        _ = shutdown_rx.changed() => {}
    }
    *backoff = (*backoff * 2).min(MAX_RECONNECT_DELAY);
}

/// Network task: owns the event loop, reports connection transitions and
/// backs off between reconnect attempts (reset on success).
///
/// The `link_rx` flag is the harness's deterministic kill switch: while the
/// link is down the event loop is simply not polled, so keepalive lapses
/// and the broker drops the session, exactly like a severed network.
pub(crate) async fn connection_task(
    mut eventloop: EventLoop,
    state: Arc<watch::Sender<ConnectionState>>,
    mut link_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    device_id: String,
) {
    let mut backoff = INITIAL_RECONNECT_DELAY;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if !*link_rx.borrow() {
            let _ = state.send(ConnectionState::Disconnected);
            debug!(%device_id, "link down; connection parked");
            tokio::select! {
                _ = link_rx.changed() => {
                    if *link_rx.borrow() {
                        info!(%device_id, "link restored; reconnecting");
                        let _ = state.send(ConnectionState::Connecting);
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
            continue;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = link_rx.changed() => {
                if !*link_rx.borrow() {
                    let _ = state.send(ConnectionState::Disconnected);
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!(%device_id, "connected to broker");
                        backoff = INITIAL_RECONNECT_DELAY;
                        let _ = state.send(ConnectionState::Connected);
                    } else {
                        // Bad credentials / client id: retrying will not
                        // help quickly, so hold at the capped backoff.
                        error!(%device_id, code = ?ack.code, "broker refused connection");
                        let _ = state.send(ConnectionState::Disconnected);
                        sleep_backoff(&mut backoff, &mut shutdown_rx).await;
                        let _ = state.send(ConnectionState::Connecting);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%device_id, error = %e, delay = ?backoff, "connection error");
                    let _ = state.send(ConnectionState::Disconnected);
                    sleep_backoff(&mut backoff, &mut shutdown_rx).await;
                    let _ = state.send(ConnectionState::Connecting);
                }
            }
        }
    }

    debug!(%device_id, "connection task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    #[test]
    fn qos_mapping_defaults_to_at_least_once() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtLeastOnce);
    }

    #[test]
    fn tls_without_ca_is_a_config_error() {
        let mut config = DeviceConfig::new("veh_001");
        config.transport = TransportConfig {
            use_tls: true,
            ..TransportConfig::default()
        };

        assert!(matches!(
            mqtt_options(&config),
            Err(TransportSetupError::MissingCaCerts)
        ));
    }

    #[test]
    fn plain_tcp_options_carry_session_settings() {
        let config = DeviceConfig::new("veh_001");
        let options = mqtt_options(&config).unwrap();
        assert_eq!(options.keep_alive(), KEEPALIVE);
        assert!(!options.clean_session());
    }
}
