//! Fleet telemetry collector.
//!
//! Subscribes to per-device MQTT topics, buffers raw deliveries in a
//! bounded in-memory ring, shapes them into typed measurement points on a
//! small worker pool, and writes them to InfluxDB in size/time-triggered
//! batches with bounded retries.
//!
//! The receive path never blocks and never decodes: a full ring drops the
//! newest message and counts it. Loss under transient outage is covered on
//! the device side by its durable outbox, not here.

pub mod config;
pub mod pipeline;
pub mod point;
pub mod ring;
pub mod service;
pub mod shaper;
pub mod stats;
pub mod status;
pub mod store;
pub mod subscriber;
pub mod writer;

// Re-export main types
pub use config::CollectorConfig;
pub use point::{FieldValue, Point};
pub use ring::{IngestRing, RawMessage, RingError};
pub use service::{CollectorService, ServiceError};
pub use shaper::{shape_point, ShapeError, COLLECTOR_LABEL, MEASUREMENT};
pub use stats::CollectorStats;
pub use status::{DeviceStatus, DeviceStatusTracker};
pub use store::{DeviceLastSeen, LatencySample, StoreClient, StoreConfig, StoreError};
pub use subscriber::{DEVICE_DATA_TOPIC, LEGACY_SPEED_TOPIC};
pub use writer::{BatchingWriter, PointSink, WriterConfig};
