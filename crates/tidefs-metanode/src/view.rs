//! Data-tier view consumed by the deletion worker.
//!
//! The cluster controller owns the authoritative placement map; a meta
//! partition only needs "the replica hosts for data partition X, leader
//! first", refreshed periodically. Tests plug in the static view.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// Cadence of the vol-view refresh worker.
pub const VOL_VIEW_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Source of data-partition replica sets.
pub trait DataPartitionView: Send + Sync {
    /// Replica hosts for `partition_id`, leader at index 0.
    fn partition_hosts(&self, partition_id: u32) -> Option<Vec<String>>;

    /// Re-pulls the view from the cluster controller; the default view
    /// is static and refreshes to itself.
    fn refresh(&self) {}
}

/// Fixed placement map, for tests and single-node deployments.
#[derive(Default)]
pub struct StaticDataView {
    hosts: RwLock<HashMap<u32, Vec<String>>>,
}

impl StaticDataView {
    /// Creates an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the replica set for a data partition, leader first.
    pub fn set_hosts(&self, partition_id: u32, hosts: Vec<String>) {
        self.hosts.write().unwrap().insert(partition_id, hosts);
    }
}

impl DataPartitionView for StaticDataView {
    fn partition_hosts(&self, partition_id: u32) -> Option<Vec<String>> {
        self.hosts.read().unwrap().get(&partition_id).cloned()
    }
}

/// Spawns the vol-view refresh worker: re-pulls the data partition view
/// every five minutes until the stop signal fires.
pub fn start_vol_view_worker(
    view: std::sync::Arc<dyn DataPartitionView>,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(VOL_VIEW_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    view.refresh();
                    debug!("data partition view refreshed");
                }
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    })
}
