//! Telemetry sample generation and serialization.
//!
//! One [`SampleSource`] per device produces a [`Sample`] each tick: a
//! realistic speed walk, a synthesized host-telemetry snapshot and a sticky
//! detection label. Samples serialize to the flat JSON wire shape the
//! collector recognizes.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const SPEED_MIN: f64 = 0.0;
const SPEED_MAX: f64 = 120.0;

/// Random walk with acceleration toward a drifting target speed.
#[derive(Debug, Clone)]
pub struct SpeedWalk {
    current: f64,
    target: f64,
    accel_rate: f64,
}

impl SpeedWalk {
    pub fn new(rng: &mut impl Rng) -> Self {
        Self {
            current: rng.gen_range(20.0..60.0),
            target: rng.gen_range(30.0..100.0),
            accel_rate: rng.gen_range(0.5..2.0),
        }
    }

    /// Next speed value, rounded to two decimals and clamped to the valid
    /// range.
    pub fn next(&mut self, rng: &mut impl Rng) -> f64 {
        // Occasionally pick a new target
        if rng.gen::<f64>() < 0.05 {
            self.target = rng.gen_range(SPEED_MIN..SPEED_MAX);
        }

        let diff = self.target - self.current;
        if diff.abs() > 0.1 {
            self.current += diff.abs().min(self.accel_rate) * diff.signum();
        } else {
            // Small variations while holding the target
            self.current += rng.gen_range(-1.0..1.0);
        }

        let noise: f64 = rng.sample::<f64, _>(StandardNormal) * 0.5;
        self.current = (self.current + noise).clamp(SPEED_MIN, SPEED_MAX);

        (self.current * 100.0).round() / 100.0
    }
}

/// Driver-state labels a detection model would emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionLabel {
    Normal,
    EyesClosed,
    Distracted,
    Smoking,
    PhoneUsage,
    Yawning,
    Drowsy,
}

impl DetectionLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::EyesClosed => "eyes_closed",
            Self::Distracted => "distracted",
            Self::Smoking => "smoking",
            Self::PhoneUsage => "phone_usage",
            Self::Yawning => "yawning",
            Self::Drowsy => "drowsy",
        }
    }
}

/// Labels the walk can newly enter; `yawning` and `drowsy` only appear in
/// replayed historical data.
const TRIGGERED_LABELS: [DetectionLabel; 4] = [
    DetectionLabel::EyesClosed,
    DetectionLabel::Distracted,
    DetectionLabel::Smoking,
    DetectionLabel::PhoneUsage,
];

/// Sticky label walk: mostly `normal`, occasional short-lived incidents.
#[derive(Debug, Clone)]
pub struct DetectionWalk {
    current: DetectionLabel,
    duration_ticks: u32,
    reset_after: u32,
}

impl Default for DetectionWalk {
    fn default() -> Self {
        Self {
            current: DetectionLabel::Normal,
            duration_ticks: 0,
            reset_after: 0,
        }
    }
}

impl DetectionWalk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the walk one tick; returns the label and its confidence.
    ///
    /// A non-normal label persists for 3-5 ticks before resetting, unless a
    /// new incident replaces it first.
    pub fn next(&mut self, rng: &mut impl Rng) -> (DetectionLabel, f64) {
        if rng.gen::<f64>() < 0.9 {
            if self.current != DetectionLabel::Normal {
                self.duration_ticks += 1;
                if self.duration_ticks > self.reset_after {
                    self.current = DetectionLabel::Normal;
                    self.duration_ticks = 0;
                }
            }
        } else {
            self.current = TRIGGERED_LABELS[rng.gen_range(0..TRIGGERED_LABELS.len())];
            self.duration_ticks = 0;
            self.reset_after = rng.gen_range(3..=5);
        }

        let confidence = if self.current == DetectionLabel::Normal {
            1.0
        } else {
            rng.gen_range(0.75..0.99)
        };
        (self.current, confidence)
    }

    pub fn current(&self) -> DetectionLabel {
        self.current
    }
}

/// Snapshot of synthesized host telemetry.
#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub memory_total: i64,
    pub memory_used: i64,
    pub memory_available: i64,
    pub memory_percent: f64,
    pub disk_total: i64,
    pub disk_used: i64,
    pub disk_free: i64,
    pub disk_percent: f64,
    pub network_bytes_sent: i64,
    pub network_bytes_recv: i64,
}

/// Host telemetry walk. Sensors are synthetic: utilization wanders inside
/// plausible bounds and the network counters only ever grow.
#[derive(Debug, Clone)]
pub struct TelemetryWalk {
    cpu: f64,
    ram: f64,
    memory_total: i64,
    disk_total: i64,
    disk_used: i64,
    net_sent: i64,
    net_recv: i64,
}

impl TelemetryWalk {
    pub fn new(rng: &mut impl Rng) -> Self {
        let disk_total: i64 = 64 * 1024 * 1024 * 1024;
        Self {
            cpu: rng.gen_range(5.0..40.0),
            ram: rng.gen_range(20.0..60.0),
            memory_total: 8 * 1024 * 1024 * 1024,
            disk_total,
            disk_used: (disk_total as f64 * rng.gen_range(0.3..0.7)) as i64,
            net_sent: rng.gen_range(0..1_000_000),
            net_recv: rng.gen_range(0..1_000_000),
        }
    }

    pub fn next(&mut self, rng: &mut impl Rng) -> TelemetrySnapshot {
        self.cpu = (self.cpu + rng.gen_range(-5.0..5.0)).clamp(0.0, 100.0);
        self.ram = (self.ram + rng.gen_range(-2.0..2.0)).clamp(5.0, 95.0);
        self.net_sent += rng.gen_range(1_000..50_000);
        self.net_recv += rng.gen_range(1_000..80_000);

        let memory_used = (self.memory_total as f64 * self.ram / 100.0) as i64;
        TelemetrySnapshot {
            cpu_usage: (self.cpu * 10.0).round() / 10.0,
            ram_usage: (self.ram * 10.0).round() / 10.0,
            memory_total: self.memory_total,
            memory_used,
            memory_available: self.memory_total - memory_used,
            memory_percent: (self.ram * 10.0).round() / 10.0,
            disk_total: self.disk_total,
            disk_used: self.disk_used,
            disk_free: self.disk_total - self.disk_used,
            disk_percent: ((self.disk_used as f64 / self.disk_total as f64) * 1000.0).round()
                / 10.0,
            network_bytes_sent: self.net_sent,
            network_bytes_recv: self.net_recv,
        }
    }
}

/// One telemetry sample in the flat wire shape.
///
/// `timestamp` is the producer's send time, captured immediately before
/// serialization; the collector carries it through to the store as the
/// `publish_timestamp` field for latency measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    pub timestamp: f64,
    pub datetime: String,
    pub speed: f64,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub memory_total: i64,
    pub memory_used: i64,
    pub memory_available: i64,
    pub memory_percent: f64,
    pub disk_total: i64,
    pub disk_used: i64,
    pub disk_free: i64,
    pub disk_percent: f64,
    pub network_bytes_sent: i64,
    pub network_bytes_recv: i64,
    pub detection_label: String,
    pub detection_confidence: f64,
    pub detection_timestamp: f64,
}

impl Sample {
    /// Serializes to the wire payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Per-device sample generator.
pub struct SampleSource {
    device_id: String,
    speed: SpeedWalk,
    detection: DetectionWalk,
    telemetry: TelemetryWalk,
    rng: StdRng,
}

impl SampleSource {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::with_rng(device_id, StdRng::from_entropy())
    }

    /// Deterministic source for tests.
    pub fn with_rng(device_id: impl Into<String>, mut rng: StdRng) -> Self {
        Self {
            device_id: device_id.into(),
            speed: SpeedWalk::new(&mut rng),
            detection: DetectionWalk::new(),
            telemetry: TelemetryWalk::new(&mut rng),
            rng,
        }
    }

    /// Produces the next sample, stamped with the current wall time.
    pub fn next_sample(&mut self) -> Sample {
        let speed = self.speed.next(&mut self.rng);
        let telemetry = self.telemetry.next(&mut self.rng);
        let (label, confidence) = self.detection.next(&mut self.rng);
        let now = epoch_seconds();

        Sample {
            device_id: self.device_id.clone(),
            timestamp: now,
            datetime: Utc::now().to_rfc3339(),
            speed,
            cpu_usage: telemetry.cpu_usage,
            ram_usage: telemetry.ram_usage,
            memory_total: telemetry.memory_total,
            memory_used: telemetry.memory_used,
            memory_available: telemetry.memory_available,
            memory_percent: telemetry.memory_percent,
            disk_total: telemetry.disk_total,
            disk_used: telemetry.disk_used,
            disk_free: telemetry.disk_free,
            disk_percent: telemetry.disk_percent,
            network_bytes_sent: telemetry.network_bytes_sent,
            network_bytes_recv: telemetry.network_bytes_recv,
            detection_label: label.as_str().to_string(),
            detection_confidence: confidence,
            detection_timestamp: now,
        }
    }
}
