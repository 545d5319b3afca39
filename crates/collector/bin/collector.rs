//! Collector binary: MQTT → ring → workers → InfluxDB.
//!
//! Exit codes: 0 on clean shutdown, 1 when `--connect-required` is set and
//! the store is unreachable, 2 on configuration errors (clap).

use clap::Parser;
use fleet_collector::{
    CollectorConfig, CollectorService, ServiceError, StoreConfig, WriterConfig,
};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "collector", about = "Fleet telemetry ingestion collector")]
struct Args {
    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER_HOST", default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_BROKER_PORT", default_value_t = 1883)]
    broker_port: u16,

    /// MQTT username
    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD")]
    password: Option<String>,

    /// MQTT client id (persistent session)
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "mqtt-collector-fleet")]
    client_id: String,

    /// InfluxDB base URL
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

    /// Number of decode/write workers
    #[arg(long, default_value_t = 4)]
    worker_threads: usize,

    /// Ingest ring capacity
    #[arg(long, default_value_t = 10_000)]
    ring_capacity: usize,

    /// Points per write batch
    #[arg(long, default_value_t = 250)]
    batch_size: usize,

    /// Time-based flush interval in milliseconds
    #[arg(long, default_value_t = 500)]
    flush_interval_ms: u64,

    /// Initial retry delay in milliseconds
    #[arg(long, default_value_t = 5_000)]
    retry_interval_ms: u64,

    /// Retry attempts per batch
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Cap on the retry backoff in milliseconds
    #[arg(long, default_value_t = 30_000)]
    max_retry_delay_ms: u64,

    /// Fail startup if the store is unreachable
    #[arg(long, default_value_t = false)]
    connect_required: bool,
}

impl Args {
    fn into_config(self) -> CollectorConfig {
        CollectorConfig {
            broker_host: self.broker_host,
            broker_port: self.broker_port,
            username: self.username,
            password: self.password,
            client_id: self.client_id,
            worker_threads: self.worker_threads,
            ring_capacity: self.ring_capacity,
            writer: WriterConfig {
                batch_size: self.batch_size,
                flush_interval: Duration::from_millis(self.flush_interval_ms),
                max_retries: self.max_retries,
                retry_interval: Duration::from_millis(self.retry_interval_ms),
                max_retry_delay: Duration::from_millis(self.max_retry_delay_ms),
                ..WriterConfig::default()
            },
            store: StoreConfig {
                url: self.store_url,
                token: self.token,
                org: self.org,
                bucket: self.bucket,
            },
            connect_required: self.connect_required,
            ..CollectorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Args::parse().into_config();

    let service = match CollectorService::start(config).await {
        Ok(service) => service,
        Err(e @ ServiceError::StoreUnreachable(_)) => {
            error!(error = %e, "fatal startup failure");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for interrupt");
    }
    info!("interrupt received");

    service.shutdown().await;
    ExitCode::SUCCESS
}
