//! Disconnection scenarios and their results.

use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

/// One network-failure scenario: sever a share of the fleet for a while,
/// then reconnect and watch the backlog drain.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub name: String,
    /// Share of the fleet to disconnect, 1-100.
    pub disconnect_percent: u32,
    pub duration: Duration,
}

impl Scenario {
    pub fn new(disconnect_percent: u32, duration_minutes: u64) -> Self {
        Self {
            name: format!("{disconnect_percent}% devices - {duration_minutes} minutes"),
            disconnect_percent,
            duration: Duration::from_secs(duration_minutes * 60),
        }
    }

    /// Number of victims out of a fleet of `device_count`.
    pub fn victim_count(&self, device_count: usize) -> usize {
        device_count * self.disconnect_percent as usize / 100
    }
}

/// The default battery.
pub fn default_battery() -> Vec<Scenario> {
    vec![
        Scenario::new(20, 5),
        Scenario::new(30, 10),
        Scenario::new(50, 15),
        Scenario::new(20, 30),
        Scenario::new(50, 30),
    ]
}

/// Parses `percent:minutes`, e.g. `20:5`.
impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (percent, minutes) = s
            .split_once(':')
            .ok_or_else(|| format!("expected percent:minutes, got {s:?}"))?;
        let percent: u32 = percent
            .parse()
            .map_err(|e| format!("bad percent in {s:?}: {e}"))?;
        let minutes: u64 = minutes
            .parse()
            .map_err(|e| format!("bad minutes in {s:?}: {e}"))?;
        if percent == 0 || percent > 100 {
            return Err(format!("percent must be 1-100, got {percent}"));
        }
        Ok(Scenario::new(percent, minutes))
    }
}

/// Queue depth over time while the victims were severed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueHistory {
    /// Seconds since disconnection.
    pub times: Vec<f64>,
    /// Total queued records across all victims at that time.
    pub sizes: Vec<u64>,
}

/// Everything recorded for one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub timestamp: String,
    pub device_count: usize,
    pub disconnect_percent: u32,
    pub disconnect_duration_seconds: f64,
    pub devices_disconnected: usize,

    // Queue statistics
    pub initial_queue_size: u64,
    pub final_queue_size_before_reconnect: u64,
    pub messages_queued_during_disconnect: u64,
    pub max_queue_per_device: u64,
    pub queue_growth_rate_msg_per_sec: f64,
    pub queue_history: QueueHistory,

    // Flush results
    pub flush_time_seconds: f64,
    pub all_messages_flushed: bool,
    pub final_queue_size_after_flush: u64,
    pub messages_flushed: u64,
    pub flush_rate_msg_per_sec: f64,

    // Capacity limits
    pub devices_at_queue_limit: usize,
    pub max_queue_size_reached: u64,

    // Target compliance
    pub flush_time_target_met: bool,
    pub target_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_battery_matches_the_standard_runs() {
        let battery = default_battery();
        assert_eq!(battery.len(), 5);
        assert_eq!(battery[0].disconnect_percent, 20);
        assert_eq!(battery[0].duration, Duration::from_secs(300));
        assert_eq!(battery[4].disconnect_percent, 50);
        assert_eq!(battery[4].duration, Duration::from_secs(1800));
    }

    #[test]
    fn victim_count_takes_the_floor() {
        let scenario = Scenario::new(30, 5);
        assert_eq!(scenario.victim_count(50), 15);
        assert_eq!(scenario.victim_count(7), 2);
        assert_eq!(scenario.victim_count(1), 0);
    }

    #[test]
    fn parses_percent_minutes_pairs() {
        let scenario: Scenario = "20:5".parse().unwrap();
        assert_eq!(scenario.disconnect_percent, 20);
        assert_eq!(scenario.duration, Duration::from_secs(300));

        assert!("20".parse::<Scenario>().is_err());
        assert!("0:5".parse::<Scenario>().is_err());
        assert!("120:5".parse::<Scenario>().is_err());
        assert!("x:5".parse::<Scenario>().is_err());
    }
}
