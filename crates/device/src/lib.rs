//! Fleet edge device client.
//!
//! Each device produces one telemetry sample per tick and publishes it over
//! MQTT with QoS 1 on `device/data/{device_id}`. While the broker is
//! unreachable, samples land in a durable per-device outbox and are
//! replayed in order after reconnecting; the outbox is bounded with
//! drop-oldest eviction, so a long outage costs the oldest backlog, never
//! the device.

pub mod client;
pub mod config;
pub mod mqtt;
pub mod sample;
pub mod simulator;

// Re-export main types
pub use client::{
    publish_or_queue, replay_outbox, ConnectionState, PublishError, PublishSink, ReplayOutcome,
    TickOutcome,
};
pub use config::{DeviceConfig, TransportConfig};
pub use mqtt::{MqttSink, TransportSetupError};
pub use sample::{DetectionLabel, DetectionWalk, Sample, SampleSource, SpeedWalk, TelemetryWalk};
pub use simulator::{launch, DeviceError, DeviceHandle};
