//! End-to-end latency statistics from stored points.
//!
//! Latency is `(write_time - publish_timestamp) * 1000` per stored point;
//! samples outside (0, 60000) ms are discarded as clock skew or stale
//! backlog replays before the percentiles are computed.

use fleet_collector::LatencySample;
use serde::Serialize;

/// Latency SLO: p95 under two seconds.
pub const P95_TARGET_MS: f64 = 2_000.0;
/// Secondary target: p99 under five seconds.
pub const P99_TARGET_MS: f64 = 5_000.0;

const VALID_RANGE_MS: (f64, f64) = (0.0, 60_000.0);

/// Aggregated latency distribution over one query window.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    /// Samples outside the valid range, excluded from the stats.
    pub discarded: usize,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub p95_target_met: bool,
    pub p99_target_met: bool,
}

impl LatencyStats {
    /// Computes stats from raw samples; `None` when no valid sample
    /// remains.
    pub fn from_samples(samples: &[LatencySample]) -> Option<Self> {
        let mut latencies: Vec<f64> = Vec::with_capacity(samples.len());
        let mut discarded = 0usize;

        for sample in samples {
            let latency_ms = (sample.write_time - sample.publish_timestamp) * 1_000.0;
            if latency_ms > VALID_RANGE_MS.0 && latency_ms < VALID_RANGE_MS.1 {
                latencies.push(latency_ms);
            } else {
                discarded += 1;
            }
        }

        if latencies.is_empty() {
            return None;
        }
        latencies.sort_by(|a, b| a.total_cmp(b));

        let count = latencies.len();
        let mean_ms = latencies.iter().sum::<f64>() / count as f64;
        let p95_ms = percentile(&latencies, 0.95);
        let p99_ms = percentile(&latencies, 0.99);

        Some(Self {
            count,
            discarded,
            min_ms: latencies[0],
            mean_ms,
            median_ms: percentile(&latencies, 0.50),
            p95_ms,
            p99_ms,
            max_ms: latencies[count - 1],
            p95_target_met: p95_ms < P95_TARGET_MS,
            p99_target_met: p99_ms < P99_TARGET_MS,
        })
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device: &str, publish: f64, write: f64) -> LatencySample {
        LatencySample {
            device_id: device.to_string(),
            publish_timestamp: publish,
            write_time: write,
        }
    }

    #[test]
    fn empty_input_yields_no_stats() {
        assert!(LatencyStats::from_samples(&[]).is_none());
    }

    #[test]
    fn single_sample_stats() {
        let stats = LatencyStats::from_samples(&[sample("d", 100.0, 100.5)]).unwrap();
        assert_eq!(stats.count, 1);
        assert!((stats.min_ms - 500.0).abs() < 1e-9);
        assert!((stats.max_ms - 500.0).abs() < 1e-9);
        assert!((stats.p95_ms - 500.0).abs() < 1e-9);
        assert!(stats.p95_target_met);
    }

    #[test]
    fn out_of_range_samples_are_discarded() {
        let samples = vec![
            sample("d", 100.0, 100.2),  // 200 ms, valid
            sample("d", 100.0, 99.9),   // negative: clock skew
            sample("d", 100.0, 200.0),  // 100 s: stale replay
            sample("d", 100.0, 100.0),  // exactly zero: excluded
        ];
        let stats = LatencyStats::from_samples(&samples).unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.discarded, 3);
    }

    #[test]
    fn percentiles_over_a_known_distribution() {
        // 1..=100 ms, one sample each
        let samples: Vec<LatencySample> = (1..=100)
            .map(|i| sample("d", 1000.0, 1000.0 + i as f64 / 1000.0))
            .collect();
        let stats = LatencyStats::from_samples(&samples).unwrap();

        assert_eq!(stats.count, 100);
        assert!((stats.min_ms - 1.0).abs() < 1e-9);
        assert!((stats.max_ms - 100.0).abs() < 1e-9);
        assert!((stats.median_ms - 50.0).abs() < 1e-9);
        assert!((stats.p95_ms - 95.0).abs() < 1e-9);
        assert!((stats.p99_ms - 99.0).abs() < 1e-9);
        assert!((stats.mean_ms - 50.5).abs() < 1e-9);
        assert!(stats.p95_target_met && stats.p99_target_met);
    }

    #[test]
    fn slo_violation_is_reported() {
        // Every sample at 3 s: p95 target missed, p99 target met
        let samples: Vec<LatencySample> =
            (0..50).map(|_| sample("d", 100.0, 103.0)).collect();
        let stats = LatencyStats::from_samples(&samples).unwrap();
        assert!(!stats.p95_target_met);
        assert!(stats.p99_target_met);
    }
}
