//! Collector service: wires the subscriber, ring, worker pool and writer
//! together and owns their lifecycle.

use crate::config::CollectorConfig;
use crate::pipeline::{spawn_flush_ticker, spawn_workers};
use crate::ring::IngestRing;
use crate::stats::CollectorStats;
use crate::status::DeviceStatusTracker;
use crate::store::{StoreClient, StoreError};
use crate::subscriber::{mqtt_options, spawn_subscriber};
use crate::writer::BatchingWriter;
use rumqttc::AsyncClient;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Capacity of the MQTT client's internal request channel.
const MQTT_CHANNEL_CAPACITY: usize = 64;

/// Fatal startup failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The store did not answer the health probe and connect-required mode
    /// is on.
    #[error("store unreachable at startup: {0}")]
    StoreUnreachable(#[source] StoreError),
}

/// A running collector pipeline.
pub struct CollectorService {
    stats: Arc<CollectorStats>,
    status: Arc<DeviceStatusTracker>,
    ring: IngestRing,
    writer: Arc<BatchingWriter<StoreClient>>,
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl CollectorService {
    /// Starts every pipeline task. Returns once the tasks are spawned; the
    /// broker connection is established (and re-established) in the
    /// background.
    pub async fn start(config: CollectorConfig) -> Result<Self, ServiceError> {
        let stats = Arc::new(CollectorStats::new());
        let status = Arc::new(DeviceStatusTracker::default());

        let store = StoreClient::new(config.store.clone());
        if config.connect_required {
            store.ping().await.map_err(ServiceError::StoreUnreachable)?;
            info!(url = %config.store.url, "store reachable");
        }

        let ring = IngestRing::new(config.ring_capacity);
        let writer = Arc::new(BatchingWriter::new(
            store,
            config.writer.clone(),
            Arc::clone(&stats),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let (client, eventloop) = AsyncClient::new(mqtt_options(&config), MQTT_CHANNEL_CAPACITY);
        spawn_subscriber(
            client.clone(),
            eventloop,
            ring.clone(),
            Arc::clone(&stats),
            shutdown_rx.clone(),
            &mut tasks,
        );
        spawn_workers(
            config.worker_threads,
            &ring,
            &writer,
            &status,
            &stats,
            &shutdown_rx,
            config.shutdown_grace,
            &mut tasks,
        );
        spawn_flush_ticker(&writer, &shutdown_rx, &mut tasks);
        Self::spawn_status_ticker(&stats, &status, &shutdown_rx, &mut tasks);

        info!(
            workers = config.worker_threads,
            ring_capacity = config.ring_capacity,
            batch_size = config.writer.batch_size,
            "collector pipeline started"
        );

        Ok(Self {
            stats,
            status,
            ring,
            writer,
            client,
            shutdown_tx,
            tasks,
        })
    }

    fn spawn_status_ticker(
        stats: &Arc<CollectorStats>,
        status: &Arc<DeviceStatusTracker>,
        shutdown_rx: &watch::Receiver<bool>,
        tasks: &mut JoinSet<()>,
    ) {
        let stats = Arc::clone(stats);
        let status = Arc::clone(status);
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            tick.tick().await; // discard the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        info!(
                            devices_online = status.online_count(),
                            received = stats.received(),
                            decoded = stats.decoded(),
                            points_written = stats.points_written(),
                            dropped_on_ring_full = stats.dropped_on_ring_full(),
                            write_failures = stats.write_failures(),
                            "pipeline status"
                        );
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub fn stats(&self) -> &Arc<CollectorStats> {
        &self.stats
    }

    pub fn status(&self) -> &Arc<DeviceStatusTracker> {
        &self.status
    }

    /// Graceful shutdown: signal every task, let the workers drain within
    /// their grace period, force a final writer flush, and account for
    /// anything left in the ring.
    pub async fn shutdown(mut self) {
        info!("collector shutting down");
        let _ = self.shutdown_tx.send(true);
        let _ = self.client.disconnect().await;

        while self.tasks.join_next().await.is_some() {}

        let remaining = self.ring.len() as u64;
        if remaining > 0 {
            CollectorStats::add(&self.stats.dropped_on_shutdown, remaining);
            warn!(remaining, "ring not drained before grace expired");
        }

        self.writer.close().await;
        info!(
            received = self.stats.received(),
            points_written = self.stats.points_written(),
            dropped_on_ring_full = self.stats.dropped_on_ring_full(),
            dropped_on_shutdown = self.stats.dropped_on_shutdown(),
            "collector stopped"
        );
    }
}
