//! In-memory device status tracking.
//!
//! Every shaped message updates its device's last-seen time; a device is
//! reported online while its newest message is younger than the timeout
//! (10 s by default, matching the store-side last-seen query).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy)]
struct DeviceEntry {
    last_seen: Instant,
    message_count: u64,
}

/// Point-in-time status for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub online: bool,
    pub message_count: u64,
}

/// Tracks last-seen and message counts per device.
pub struct DeviceStatusTracker {
    devices: Mutex<HashMap<String, DeviceEntry>>,
    timeout: Duration,
}

impl Default for DeviceStatusTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl DeviceStatusTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Records one message from `device_id`.
    pub fn update(&self, device_id: &str) {
        let mut devices = self.devices.lock().unwrap();
        match devices.get_mut(device_id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                entry.message_count += 1;
            }
            None => {
                info!(device_id, "new device detected");
                devices.insert(
                    device_id.to_string(),
                    DeviceEntry {
                        last_seen: Instant::now(),
                        message_count: 1,
                    },
                );
            }
        }
    }

    /// Status of a single device, if it has ever been seen.
    pub fn status_of(&self, device_id: &str) -> Option<DeviceStatus> {
        let devices = self.devices.lock().unwrap();
        devices.get(device_id).map(|entry| DeviceStatus {
            device_id: device_id.to_string(),
            online: entry.last_seen.elapsed() < self.timeout,
            message_count: entry.message_count,
        })
    }

    /// Status of every known device, sorted by id.
    pub fn snapshot(&self) -> Vec<DeviceStatus> {
        let devices = self.devices.lock().unwrap();
        let mut statuses: Vec<DeviceStatus> = devices
            .iter()
            .map(|(id, entry)| DeviceStatus {
                device_id: id.clone(),
                online: entry.last_seen.elapsed() < self.timeout,
                message_count: entry.message_count,
            })
            .collect();
        statuses.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        statuses
    }

    /// Number of devices currently online.
    pub fn online_count(&self) -> usize {
        let devices = self.devices.lock().unwrap();
        devices
            .values()
            .filter(|entry| entry.last_seen.elapsed() < self.timeout)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_has_no_status() {
        let tracker = DeviceStatusTracker::default();
        assert_eq!(tracker.status_of("veh_001"), None);
    }

    #[test]
    fn update_marks_online_and_counts_messages() {
        let tracker = DeviceStatusTracker::default();
        tracker.update("veh_001");
        tracker.update("veh_001");
        tracker.update("veh_002");

        let status = tracker.status_of("veh_001").unwrap();
        assert!(status.online);
        assert_eq!(status.message_count, 2);
        assert_eq!(tracker.online_count(), 2);
    }

    #[test]
    fn stale_device_goes_offline() {
        let tracker = DeviceStatusTracker::new(Duration::from_millis(0));
        tracker.update("veh_001");

        let status = tracker.status_of("veh_001").unwrap();
        assert!(!status.online);
        assert_eq!(tracker.online_count(), 0);
    }

    #[test]
    fn snapshot_is_sorted_by_device_id() {
        let tracker = DeviceStatusTracker::default();
        tracker.update("veh_002");
        tracker.update("veh_001");

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[0].device_id, "veh_001");
        assert_eq!(snapshot[1].device_id, "veh_002");
    }
}
