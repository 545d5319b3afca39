//! Collector process configuration.
//!
//! One immutable record, built at startup and passed explicitly to the
//! pipeline. There is no other process-wide state beyond the monotonic
//! counters in [`crate::stats::CollectorStats`].

use crate::store::StoreConfig;
use crate::writer::WriterConfig;
use std::time::Duration;

/// Everything the collector process needs, captured once at startup.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Broker host.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
    /// Broker credentials, passed through as-is.
    pub username: Option<String>,
    pub password: Option<String>,
    /// MQTT client id; the session is persistent under this id.
    pub client_id: String,
    /// Number of decode/write workers draining the ring.
    pub worker_threads: usize,
    /// Bounded capacity of the ingest ring.
    pub ring_capacity: usize,
    /// Batching and retry settings for the store writer.
    pub writer: WriterConfig,
    /// Store connection settings.
    pub store: StoreConfig,
    /// Fail startup (exit 1) if the store is unreachable.
    pub connect_required: bool,
    /// How long workers keep draining the ring after the shutdown signal.
    pub shutdown_grace: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".into(),
            broker_port: 1883,
            username: None,
            password: None,
            client_id: "mqtt-collector-fleet".into(),
            worker_threads: 4,
            ring_capacity: 10_000,
            writer: WriterConfig::default(),
            store: StoreConfig {
                url: "http://localhost:8086".into(),
                token: String::new(),
                org: "my-org".into(),
                bucket: "vehicle-data".into(),
            },
            connect_required: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
