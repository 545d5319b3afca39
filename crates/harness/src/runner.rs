//! Fleet runner: launches the device fleet in-process, severs victim links
//! per scenario, samples queue growth and measures drain time after
//! reconnection.

use crate::scenario::{QueueHistory, Scenario, ScenarioResult};
use anyhow::{Context, Result};
use chrono::Utc;
use fleet_device::{DeviceConfig, DeviceHandle};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Flush compliance target.
pub const FLUSH_TARGET: Duration = Duration::from_secs(30);

/// Harness settings, captured once at startup.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub device_count: usize,
    pub broker_host: String,
    pub broker_port: u16,
    pub publish_interval: Duration,
    pub max_capacity: usize,
    pub queue_dir: PathBuf,
    pub results_dir: PathBuf,
    pub scenarios: Vec<Scenario>,
    /// Steady-state wait after fleet start.
    pub settle: Duration,
    /// Give up waiting for a drain after this long.
    pub flush_timeout: Duration,
    /// Pause between scenarios.
    pub pause_between: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            device_count: 50,
            broker_host: "localhost".into(),
            broker_port: 1883,
            publish_interval: Duration::from_secs(1),
            max_capacity: 10_000,
            queue_dir: PathBuf::from("devices/queues"),
            results_dir: PathBuf::from("testing/results"),
            scenarios: crate::scenario::default_battery(),
            settle: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(300),
            pause_between: Duration::from_secs(30),
        }
    }
}

struct FlushOutcome {
    flush_time_seconds: f64,
    all_messages_flushed: bool,
    final_queue_size: u64,
    messages_flushed: u64,
    flush_rate_msg_per_sec: f64,
}

/// A launched fleet plus the scenario machinery.
pub struct FleetRunner {
    config: HarnessConfig,
    devices: Vec<DeviceHandle>,
}

impl FleetRunner {
    /// Launches `device_count` devices (ids `vehicle_001`...), staggered
    /// slightly, then waits for steady state.
    pub async fn start(config: HarnessConfig) -> Result<Self> {
        info!(devices = config.device_count, "starting fleet");
        let mut devices = Vec::with_capacity(config.device_count);

        for i in 1..=config.device_count {
            let device_id = format!("vehicle_{i:03}");
            let device_config = DeviceConfig {
                broker_host: config.broker_host.clone(),
                broker_port: config.broker_port,
                publish_interval: config.publish_interval,
                queue_dir: config.queue_dir.clone(),
                max_capacity: config.max_capacity,
                ..DeviceConfig::new(device_id.clone())
            };
            let handle = fleet_device::launch(device_config)
                .with_context(|| format!("failed to launch {device_id}"))?;
            devices.push(handle);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(settle = ?config.settle, "waiting for steady state");
        tokio::time::sleep(config.settle).await;

        Ok(Self { config, devices })
    }

    fn victims(&self, scenario: &Scenario) -> &[DeviceHandle] {
        let n = scenario.victim_count(self.devices.len());
        &self.devices[..n]
    }

    fn total_queued(victims: &[DeviceHandle]) -> u64 {
        victims.iter().map(|d| d.outbox_size() as u64).sum()
    }

    fn max_queued(victims: &[DeviceHandle]) -> u64 {
        victims
            .iter()
            .map(|d| d.outbox_size() as u64)
            .max()
            .unwrap_or(0)
    }

    /// Samples victim queue depth every second for `duration`, logging
    /// progress every ten samples.
    async fn monitor_growth(
        victims: &[DeviceHandle],
        duration: Duration,
    ) -> (QueueHistory, u64, u64) {
        let started = Instant::now();
        let mut history = QueueHistory::default();
        let mut max_per_device = Self::max_queued(victims);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.tick().await;

        let mut samples = 0u64;
        while started.elapsed() < duration {
            tick.tick().await;
            samples += 1;

            let total = Self::total_queued(victims);
            let current_max = Self::max_queued(victims);
            max_per_device = max_per_device.max(current_max);
            history.times.push(started.elapsed().as_secs_f64());
            history.sizes.push(total);

            if samples % 10 == 0 {
                info!(
                    elapsed_s = started.elapsed().as_secs(),
                    total_queued = total,
                    max_per_device = current_max,
                    "queue growth"
                );
            }
        }

        let final_total = Self::total_queued(victims);
        (history, max_per_device, final_total)
    }

    /// Polls victim queues every 0.5 s until they drain or the timeout
    /// expires. Timing starts at the reconnect the caller just issued.
    async fn measure_flush(&self, victims: &[DeviceHandle]) -> FlushOutcome {
        let initial_total = Self::total_queued(victims);
        if initial_total == 0 {
            return FlushOutcome {
                flush_time_seconds: 0.0,
                all_messages_flushed: true,
                final_queue_size: 0,
                messages_flushed: 0,
                flush_rate_msg_per_sec: 0.0,
            };
        }

        let started = Instant::now();
        let mut last_total = initial_total;
        let mut last_log = Instant::now();

        while started.elapsed() < self.config.flush_timeout {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let total = Self::total_queued(victims);

            if total == 0 {
                let flush_time = started.elapsed().as_secs_f64();
                let rate = initial_total as f64 / flush_time.max(f64::EPSILON);
                info!(
                    flush_time_s = flush_time,
                    rate_msg_per_s = rate,
                    "all queues flushed"
                );
                return FlushOutcome {
                    flush_time_seconds: flush_time,
                    all_messages_flushed: true,
                    final_queue_size: 0,
                    messages_flushed: initial_total,
                    flush_rate_msg_per_sec: rate,
                };
            }

            if total < last_total {
                last_total = total;
                if last_log.elapsed() >= Duration::from_secs(5) {
                    info!(remaining = total, "flush in progress");
                    last_log = Instant::now();
                }
            } else if started.elapsed() > Duration::from_secs(10)
                && last_log.elapsed() >= Duration::from_secs(5)
            {
                warn!(remaining = total, "queue flush appears stuck");
                last_log = Instant::now();
            }
        }

        let final_total = Self::total_queued(victims);
        let flushed = initial_total.saturating_sub(final_total);
        let flush_time = self.config.flush_timeout.as_secs_f64();
        warn!(
            timeout_s = flush_time,
            flushed,
            remaining = final_total,
            "flush timed out"
        );
        FlushOutcome {
            flush_time_seconds: flush_time,
            all_messages_flushed: false,
            final_queue_size: final_total,
            messages_flushed: flushed,
            flush_rate_msg_per_sec: flushed as f64 / flush_time,
        }
    }

    /// Runs one scenario end to end: sever, monitor, reconnect, drain.
    pub async fn run_scenario(&self, scenario: &Scenario) -> ScenarioResult {
        info!(
            scenario = %scenario.name,
            percent = scenario.disconnect_percent,
            duration = ?scenario.duration,
            "running scenario"
        );
        let victims = self.victims(scenario);
        let initial_total = Self::total_queued(victims);

        info!(victims = victims.len(), "severing victim links");
        for device in victims {
            device.set_link(false);
        }
        let disconnect_started = Instant::now();

        let (history, max_per_device, final_before) =
            Self::monitor_growth(victims, scenario.duration).await;
        let disconnect_duration = disconnect_started.elapsed();

        let devices_at_limit = victims
            .iter()
            .filter(|d| d.outbox_size() >= d.outbox_capacity())
            .count();
        let messages_queued = final_before.saturating_sub(initial_total);

        info!(
            queued = messages_queued,
            max_per_device,
            devices_at_limit,
            "reconnecting victims"
        );
        for device in victims {
            device.set_link(true);
        }
        let flush = self.measure_flush(victims).await;

        let result = ScenarioResult {
            scenario: scenario.name.clone(),
            timestamp: Utc::now().to_rfc3339(),
            device_count: self.devices.len(),
            disconnect_percent: scenario.disconnect_percent,
            disconnect_duration_seconds: disconnect_duration.as_secs_f64(),
            devices_disconnected: victims.len(),
            initial_queue_size: initial_total,
            final_queue_size_before_reconnect: final_before,
            messages_queued_during_disconnect: messages_queued,
            max_queue_per_device: max_per_device,
            queue_growth_rate_msg_per_sec: messages_queued as f64
                / scenario.duration.as_secs_f64().max(f64::EPSILON),
            queue_history: history,
            flush_time_seconds: flush.flush_time_seconds,
            all_messages_flushed: flush.all_messages_flushed,
            final_queue_size_after_flush: flush.final_queue_size,
            messages_flushed: flush.messages_flushed,
            flush_rate_msg_per_sec: flush.flush_rate_msg_per_sec,
            devices_at_queue_limit: devices_at_limit,
            max_queue_size_reached: max_per_device,
            flush_time_target_met: flush.flush_time_seconds < FLUSH_TARGET.as_secs_f64(),
            target_seconds: FLUSH_TARGET.as_secs_f64(),
        };

        info!(
            scenario = %scenario.name,
            queued = result.messages_queued_during_disconnect,
            flush_time_s = result.flush_time_seconds,
            target_met = result.flush_time_target_met,
            all_flushed = result.all_messages_flushed,
            "scenario complete"
        );
        result
    }

    /// Runs the whole battery, saving results after every scenario.
    pub async fn run_all(&self) -> Result<Vec<ScenarioResult>> {
        let scenarios = self.config.scenarios.clone();
        let mut results = Vec::with_capacity(scenarios.len());

        for (i, scenario) in scenarios.iter().enumerate() {
            results.push(self.run_scenario(scenario).await);
            self.save_results(&results)?;

            if i + 1 < scenarios.len() {
                info!(pause = ?self.config.pause_between, "pausing before next scenario");
                tokio::time::sleep(self.config.pause_between).await;
            }
        }
        Ok(results)
    }

    /// Writes the accumulated results as one timestamped JSON file.
    pub fn save_results(&self, results: &[ScenarioResult]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config.results_dir).with_context(|| {
            format!(
                "failed to create results dir {}",
                self.config.results_dir.display()
            )
        })?;
        let filename = format!(
            "network_failure_test_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let path = self.config.results_dir.join(filename);
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "results saved");
        Ok(path)
    }

    /// Stops every device. Outbox files stay on disk.
    pub async fn shutdown(self) {
        info!("stopping fleet");
        for device in self.devices {
            device.shutdown().await;
        }
    }
}

/// Logs the end-of-run summary table.
pub fn print_summary(results: &[ScenarioResult]) {
    info!("==== scenario summary ====");
    for result in results {
        info!(
            scenario = %result.scenario,
            messages = result.messages_queued_during_disconnect,
            flush_time_s = format!("{:.2}", result.flush_time_seconds),
            target_met = result.flush_time_target_met,
            all_flushed = result.all_messages_flushed,
            devices_at_limit = result.devices_at_queue_limit,
            "result"
        );
    }
}
