//! Network-failure and latency harness for the fleet telemetry pipeline.
//!
//! Launches an in-process device fleet against a real broker, severs a
//! configurable share of it for a while, then measures how fast the
//! reconnected devices drain their outboxes; separately, computes
//! end-to-end latency percentiles from the stored points.

pub mod latency;
pub mod runner;
pub mod scenario;

pub use latency::{LatencyStats, P95_TARGET_MS, P99_TARGET_MS};
pub use runner::{print_summary, FleetRunner, HarnessConfig, FLUSH_TARGET};
pub use scenario::{default_battery, QueueHistory, Scenario, ScenarioResult};
