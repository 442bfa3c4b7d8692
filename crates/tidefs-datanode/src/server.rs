//! The data node: disks, partitions, accept loop, and per-partition
//! background workers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tidefs_transport::{ConnectPool, PoolConfig};

use crate::cluster::ClusterView;
use crate::error::DataNodeResult;
use crate::partition::DataPartition;
use crate::repair::launch_repair;
use crate::service::DataNodeService;
use crate::space::SpaceManager;

/// Status recompute and repair cadence.
pub const STATUS_UPDATE_INTERVAL: Duration = Duration::from_secs(10);
/// Dirty-extent cleanup cadence.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);
/// Runtime-metrics recompute cadence.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(2);
/// Delete-log flush cadence.
pub const FLUSH_DELETE_INTERVAL: Duration = Duration::from_secs(120);

/// Data node configuration.
#[derive(Debug, Clone)]
pub struct DataNodeConfig {
    /// Address this node serves the wire protocol on.
    pub local_addr: String,
    /// Disk roots and their capacities.
    pub disks: Vec<(PathBuf, u64)>,
}

/// One data node: space manager, connection pool, packet service, and
/// the stop signal its workers select against.
pub struct DataNode {
    service: Arc<DataNodeService>,
    space: Arc<SpaceManager>,
    pool: Arc<ConnectPool>,
    cluster: Arc<dyn ClusterView>,
    stop_tx: watch::Sender<bool>,
}

impl DataNode {
    /// Builds a node: registers disks (loading the partitions found on
    /// them), starts the pool reaper, and spawns workers for every
    /// loaded partition.
    pub fn start(config: DataNodeConfig, cluster: Arc<dyn ClusterView>) -> DataNodeResult<Arc<Self>> {
        let space = Arc::new(SpaceManager::new());
        for (path, capacity) in &config.disks {
            space.add_disk(path, *capacity)?;
        }
        let pool = Arc::new(ConnectPool::new(PoolConfig::default()));
        let (stop_tx, stop_rx) = watch::channel(false);
        pool.spawn_reaper(stop_rx);

        let service = Arc::new(DataNodeService::new(
            Arc::clone(&space),
            Arc::clone(&pool),
            Arc::clone(&cluster),
        ));
        let node = Arc::new(Self {
            service,
            space,
            pool,
            cluster,
            stop_tx,
        });
        for partition in node.space.partitions() {
            node.spawn_partition_workers(partition);
        }
        info!(addr = %config.local_addr, "data node started");
        Ok(node)
    }

    /// The node's packet service.
    pub fn service(&self) -> &Arc<DataNodeService> {
        &self.service
    }

    /// The node's space manager.
    pub fn space(&self) -> &Arc<SpaceManager> {
        &self.space
    }

    /// The node's connection pool.
    pub fn pool(&self) -> &Arc<ConnectPool> {
        &self.pool
    }

    /// Subscribes to the node's stop signal.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Accept loop: one task per incoming connection, packets handled
    /// sequentially per connection. Returns when the stop signal fires.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let service = Arc::clone(&self.service);
                            tokio::spawn(async move {
                                info!(%peer, "connection accepted");
                                service.serve_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Spawns the four ticker workers for one partition: status+repair,
    /// cleanup, metrics, and delete-log flush.
    pub fn spawn_partition_workers(self: &Arc<Self>, partition: Arc<DataPartition>) -> JoinHandle<()> {
        let view = Arc::clone(&self.cluster);
        let pool = Arc::clone(&self.pool);
        let mut stop = self.stop_signal();
        tokio::spawn(async move {
            let mut status_ticker = tokio::time::interval(STATUS_UPDATE_INTERVAL);
            let mut cleanup_ticker = tokio::time::interval(CLEANUP_INTERVAL);
            let mut metrics_ticker = tokio::time::interval(METRICS_INTERVAL);
            let mut flush_ticker = tokio::time::interval(FLUSH_DELETE_INTERVAL);
            loop {
                tokio::select! {
                    _ = status_ticker.tick() => {
                        let p = Arc::clone(&partition);
                        let _ = tokio::task::spawn_blocking(move || p.status_update()).await;
                        if let Err(e) = launch_repair(&partition, view.as_ref(), &pool).await {
                            warn!(partition_id = partition.id(), error = %e, "repair pass failed");
                        }
                    }
                    _ = cleanup_ticker.tick() => {
                        let p = Arc::clone(&partition);
                        let _ = tokio::task::spawn_blocking(move || p.store().cleanup()).await;
                    }
                    _ = metrics_ticker.tick() => {
                        partition.metrics().recompute();
                    }
                    _ = flush_ticker.tick() => {
                        let p = Arc::clone(&partition);
                        let _ = tokio::task::spawn_blocking(move || p.flush_delete()).await;
                    }
                    res = stop.changed() => {
                        if res.is_err() || *stop.borrow() {
                            partition.stop();
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Graceful shutdown: fires the stop signal and closes every
    /// partition's store.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.space.stop_all();
        info!("data node stopped");
    }
}
