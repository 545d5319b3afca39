//! Harness binary: runs the disconnection battery and reports end-to-end
//! latency from the store.
//!
//! Exit codes: 0 normal, 1 when the store is unreachable in latency-only
//! mode, 2 on configuration errors (clap).

use clap::Parser;
use fleet_collector::{StoreClient, StoreConfig};
use fleet_harness::{
    default_battery, print_summary, FleetRunner, HarnessConfig, LatencyStats, Scenario,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "failure_harness", about = "Network failure testing suite")]
struct Args {
    /// Number of devices to simulate
    #[arg(long, default_value_t = 50)]
    devices: usize,

    /// Scenario as percent:minutes (repeatable); defaults to the standard
    /// battery
    #[arg(long = "scenario")]
    scenarios: Vec<Scenario>,

    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER_HOST", default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_BROKER_PORT", default_value_t = 1883)]
    broker_port: u16,

    /// Directory for device outbox files
    #[arg(long, env = "DEVICE_QUEUE_DIR", default_value = "devices/queues")]
    queue_dir: PathBuf,

    /// Directory for result JSON files
    #[arg(long, default_value = "testing/results")]
    results_dir: PathBuf,

    /// Outbox capacity per device
    #[arg(long, default_value_t = 10_000)]
    max_capacity: usize,

    /// InfluxDB base URL (for the latency report)
    #[arg(long, env = "INFLUXDB_URL", default_value = "http://localhost:8086")]
    store_url: String,

    /// InfluxDB API token
    #[arg(long, env = "INFLUXDB_TOKEN", default_value = "")]
    token: String,

    /// InfluxDB organization
    #[arg(long, env = "INFLUXDB_ORG", default_value = "my-org")]
    org: String,

    /// InfluxDB bucket
    #[arg(long, env = "INFLUXDB_BUCKET", default_value = "vehicle-data")]
    bucket: String,

    /// Window for the latency report, in seconds
    #[arg(long, default_value_t = 300)]
    latency_window_s: u64,

    /// Skip the disconnection battery and only report latency
    #[arg(long, default_value_t = false)]
    latency_only: bool,
}

async fn latency_report(store: &StoreClient, window: Duration) -> Option<LatencyStats> {
    let samples = match store.latency_samples(window).await {
        Ok(samples) => samples,
        Err(e) => {
            error!(error = %e, "latency query failed");
            return None;
        }
    };
    info!(samples = samples.len(), window = ?window, "latency samples fetched");

    match LatencyStats::from_samples(&samples) {
        Some(stats) => {
            info!(
                count = stats.count,
                discarded = stats.discarded,
                min_ms = format!("{:.1}", stats.min_ms),
                mean_ms = format!("{:.1}", stats.mean_ms),
                median_ms = format!("{:.1}", stats.median_ms),
                p95_ms = format!("{:.1}", stats.p95_ms),
                p99_ms = format!("{:.1}", stats.p99_ms),
                max_ms = format!("{:.1}", stats.max_ms),
                p95_target_met = stats.p95_target_met,
                p99_target_met = stats.p99_target_met,
                "end-to-end latency"
            );
            Some(stats)
        }
        None => {
            warn!("no valid latency samples in the window");
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let store = StoreClient::new(StoreConfig {
        url: args.store_url.clone(),
        token: args.token.clone(),
        org: args.org.clone(),
        bucket: args.bucket.clone(),
    });

    if args.latency_only {
        if store.ping().await.is_err() {
            error!(url = %args.store_url, "store unreachable");
            return ExitCode::from(1);
        }
        latency_report(&store, Duration::from_secs(args.latency_window_s)).await;
        return ExitCode::SUCCESS;
    }

    let config = HarnessConfig {
        device_count: args.devices,
        broker_host: args.broker_host,
        broker_port: args.broker_port,
        max_capacity: args.max_capacity,
        queue_dir: args.queue_dir,
        results_dir: args.results_dir,
        scenarios: if args.scenarios.is_empty() {
            default_battery()
        } else {
            args.scenarios
        },
        ..HarnessConfig::default()
    };

    let runner = match FleetRunner::start(config).await {
        Ok(runner) => runner,
        Err(e) => {
            error!(error = %e, "fleet failed to start");
            return ExitCode::from(1);
        }
    };

    // Confirm the collector sees the fleet before injecting failures.
    match store.device_last_seen().await {
        Ok(devices) => {
            let online = devices.iter().filter(|d| d.online).count();
            info!(known = devices.len(), online, "store-side device status");
        }
        Err(e) => warn!(error = %e, "device status query failed"),
    }

    let results = match runner.run_all().await {
        Ok(results) => results,
        Err(e) => {
            error!(error = %e, "battery aborted");
            runner.shutdown().await;
            return ExitCode::from(1);
        }
    };

    print_summary(&results);
    latency_report(&store, Duration::from_secs(args.latency_window_s)).await;

    runner.shutdown().await;
    ExitCode::SUCCESS
}
