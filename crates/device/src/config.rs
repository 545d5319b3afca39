//! Device process configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Broker transport settings, passed through to the MQTT session.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Enable TLS to the broker.
    pub use_tls: bool,
    /// Development mode: trust the broker's self-signed certificate. The
    /// certificate must still be supplied via `ca_certs` so it can be
    /// pinned as the trust root.
    pub tls_insecure: bool,
    /// CA certificate path (PEM).
    pub ca_certs: Option<PathBuf>,
    /// Client certificate path (PEM), for mutual TLS.
    pub certfile: Option<PathBuf>,
    /// Client private key path (PEM).
    pub keyfile: Option<PathBuf>,
    /// Username/password pass-through.
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Everything one device process needs, captured once at startup.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub broker_host: String,
    pub broker_port: u16,
    /// Cadence of sample production.
    pub publish_interval: Duration,
    /// Directory holding the per-device outbox database.
    pub queue_dir: PathBuf,
    /// Outbox capacity; drop-oldest beyond this.
    pub max_capacity: usize,
    pub transport: TransportConfig,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            broker_host: "localhost".into(),
            broker_port: 1883,
            publish_interval: Duration::from_secs(1),
            queue_dir: PathBuf::from("devices/queues"),
            max_capacity: 10_000,
            transport: TransportConfig::default(),
        }
    }

    /// Topic this device publishes on.
    pub fn topic(&self) -> String {
        format!("device/data/{}", self.device_id)
    }

    /// MQTT client id; the broker keeps a persistent session under it.
    pub fn client_id(&self) -> String {
        format!("device_{}", self.device_id)
    }
}
