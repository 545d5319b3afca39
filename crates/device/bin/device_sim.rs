//! Device simulator binary: one process per device.
//!
//! Exit codes: 0 on clean shutdown, 2 on configuration errors (clap).

use clap::Parser;
use fleet_device::{DeviceConfig, DeviceError, TransportConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "device_sim", about = "Vehicle telemetry device simulator")]
struct Args {
    /// Stable device identifier (also names the outbox file)
    device_id: String,

    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER_HOST", default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_BROKER_PORT", default_value_t = 1883)]
    broker_port: u16,

    /// Seconds between samples
    #[arg(long, default_value_t = 1.0)]
    publish_interval_s: f64,

    /// Directory for the per-device outbox database
    #[arg(long, env = "DEVICE_QUEUE_DIR", default_value = "devices/queues")]
    queue_dir: PathBuf,

    /// Outbox capacity (drop-oldest beyond this)
    #[arg(long, default_value_t = 10_000)]
    max_capacity: usize,

    /// Enable TLS to the broker
    #[arg(long, env = "MQTT_USE_TLS", default_value_t = false)]
    use_tls: bool,

    /// Accept a self-signed broker certificate (pinned via --ca-certs)
    #[arg(long, env = "MQTT_TLS_INSECURE", default_value_t = false)]
    tls_insecure: bool,

    /// CA certificate path (PEM)
    #[arg(long, env = "MQTT_CA_CERTS")]
    ca_certs: Option<PathBuf>,

    /// Client certificate path (PEM)
    #[arg(long, env = "MQTT_CERTFILE")]
    certfile: Option<PathBuf>,

    /// Client private key path (PEM)
    #[arg(long, env = "MQTT_KEYFILE")]
    keyfile: Option<PathBuf>,

    /// MQTT username
    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD")]
    password: Option<String>,
}

impl Args {
    fn into_config(self) -> DeviceConfig {
        DeviceConfig {
            broker_host: self.broker_host,
            broker_port: self.broker_port,
            publish_interval: Duration::from_secs_f64(self.publish_interval_s),
            queue_dir: self.queue_dir,
            max_capacity: self.max_capacity,
            transport: TransportConfig {
                use_tls: self.use_tls,
                tls_insecure: self.tls_insecure,
                ca_certs: self.ca_certs,
                certfile: self.certfile,
                keyfile: self.keyfile,
                username: self.username,
                password: self.password,
            },
            ..DeviceConfig::new(self.device_id)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Args::parse().into_config();

    let handle = match fleet_device::launch(config) {
        Ok(handle) => handle,
        Err(e @ DeviceError::Transport(_)) => {
            error!(error = %e, "invalid transport configuration");
            return ExitCode::from(2);
        }
        Err(e) => {
            error!(error = %e, "device failed to start");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for interrupt");
    }
    info!("interrupt received");

    handle.shutdown().await;
    ExitCode::SUCCESS
}
