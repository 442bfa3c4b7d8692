//! The metadata manager: every meta partition mounted on this node,
//! plus the store-snapshot worker.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{MetaError, MetaResult};
use crate::partition::{expire_unlisted_partitions, MetaPartition, MetaPartitionConfig};

/// Store-snapshot ticker cadence (leader-gated).
pub const STORE_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Threshold-check cadence for apply-count-driven snapshots.
pub const STORE_THRESHOLD_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Applies accumulated before a snapshot is taken ahead of the ticker.
pub const STORE_SNAPSHOT_APPLY_THRESHOLD: u64 = 10_000;

/// Partition directory prefix under the metadata root.
pub const PARTITION_DIR_PREFIX: &str = "partition_";

/// Owns the meta partitions of one node.
pub struct MetadataManager {
    metadata_dir: PathBuf,
    node_id: u64,
    partitions: RwLock<HashMap<u64, Arc<MetaPartition>>>,
}

impl MetadataManager {
    /// Creates a manager rooted at `metadata_dir`.
    pub fn new(metadata_dir: &Path, node_id: u64) -> MetaResult<Self> {
        fs::create_dir_all(metadata_dir)?;
        Ok(Self {
            metadata_dir: metadata_dir.to_path_buf(),
            node_id,
            partitions: RwLock::new(HashMap::new()),
        })
    }

    /// The metadata root directory.
    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    /// Creates a partition directory and mounts the partition. The
    /// caller attaches the replicated log afterwards.
    pub fn create_partition(
        &self,
        mut config: MetaPartitionConfig,
    ) -> MetaResult<Arc<MetaPartition>> {
        if let Some(existing) = self.get_partition(config.partition_id) {
            return Ok(existing);
        }
        config.node_id = self.node_id;
        config.root_dir = self
            .metadata_dir
            .join(format!("{PARTITION_DIR_PREFIX}{}", config.partition_id));
        let partition = MetaPartition::new(config)?;
        partition.persist_metadata()?;
        self.partitions
            .write()
            .unwrap()
            .insert(partition.id(), Arc::clone(&partition));
        info!(partition_id = partition.id(), "meta partition created");
        Ok(partition)
    }

    /// Startup: renames local partition directories absent from the
    /// cluster's list, then loads every listed directory found.
    pub fn load_partitions(&self, listed: &[u64]) -> MetaResult<()> {
        expire_unlisted_partitions(&self.metadata_dir, listed)?;
        for entry in fs::read_dir(&self.metadata_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id_str) = name.strip_prefix(PARTITION_DIR_PREFIX) else {
                continue;
            };
            let Ok(partition_id) = id_str.parse::<u64>() else {
                continue;
            };
            match MetaPartition::load(&entry.path(), self.node_id) {
                Ok(partition) => {
                    self.partitions
                        .write()
                        .unwrap()
                        .insert(partition_id, partition);
                    info!(partition_id, "meta partition loaded");
                }
                Err(e) => {
                    // A partition that cannot boot is renamed aside, never
                    // deleted; a human decides its fate.
                    warn!(partition_id, error = %e, "partition boot failed, expiring directory");
                    let _ = fs::rename(
                        entry.path(),
                        self.metadata_dir.join(format!(
                            "{}{}_{}",
                            crate::partition::EXPIRED_PARTITION_PREFIX,
                            name,
                            std::time::SystemTime::now()
                                .duration_since(std::time::UNIX_EPOCH)
                                .map(|d| d.as_secs())
                                .unwrap_or(0)
                        )),
                    );
                }
            }
        }
        Ok(())
    }

    /// Looks a mounted partition up.
    pub fn get_partition(&self, partition_id: u64) -> Option<Arc<MetaPartition>> {
        self.partitions.read().unwrap().get(&partition_id).cloned()
    }

    /// Requires a mounted partition.
    pub fn partition(&self, partition_id: u64) -> MetaResult<Arc<MetaPartition>> {
        self.get_partition(partition_id)
            .ok_or_else(|| MetaError::Again(format!("meta partition {partition_id} not mounted")))
    }

    /// Every mounted partition.
    pub fn partitions(&self) -> Vec<Arc<MetaPartition>> {
        self.partitions.read().unwrap().values().cloned().collect()
    }

    /// Stops every partition: final snapshot and config persist.
    pub fn stop_all(&self) {
        for partition in self.partitions() {
            partition.stop();
        }
    }
}

/// Spawns the store-snapshot worker for one partition: snapshots on the
/// five-minute ticker and early once enough applies accumulate, both
/// only while the partition leads.
pub fn start_snapshot_worker(
    partition: Arc<MetaPartition>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut snapshot_ticker = tokio::time::interval(STORE_SNAPSHOT_INTERVAL);
        let mut threshold_ticker = tokio::time::interval(STORE_THRESHOLD_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = snapshot_ticker.tick() => {
                    if partition.store_ticks_enabled() && partition.pending_applies() > 0 {
                        snapshot_blocking(&partition).await;
                    }
                }
                _ = threshold_ticker.tick() => {
                    if partition.store_ticks_enabled()
                        && partition.pending_applies() >= STORE_SNAPSHOT_APPLY_THRESHOLD
                    {
                        snapshot_blocking(&partition).await;
                    }
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

async fn snapshot_blocking(partition: &Arc<MetaPartition>) {
    let p = Arc::clone(partition);
    let result = tokio::task::spawn_blocking(move || p.store_snapshot()).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "store snapshot failed"),
        Err(e) => warn!(error = %e, "store snapshot task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{Peer, StoreType};
    use tempfile::tempdir;

    fn config(partition_id: u64) -> MetaPartitionConfig {
        MetaPartitionConfig {
            partition_id,
            vol_name: "vol1".into(),
            start: 0,
            end: 1 << 20,
            peers: vec![Peer {
                id: 1,
                addr: "127.0.0.1:17210".into(),
            }],
            learners: Vec::new(),
            store_type: StoreType::Memory,
            node_id: 0,
            root_dir: PathBuf::new(),
        }
    }

    #[test]
    fn test_create_and_reload() {
        let dir = tempdir().unwrap();
        {
            let manager = MetadataManager::new(dir.path(), 1).unwrap();
            let partition = manager.create_partition(config(3)).unwrap();
            assert_eq!(partition.id(), 3);
            // Idempotent create returns the mounted instance.
            let again = manager.create_partition(config(3)).unwrap();
            assert!(Arc::ptr_eq(&partition, &again));
            manager.stop_all();
        }
        let manager = MetadataManager::new(dir.path(), 1).unwrap();
        manager.load_partitions(&[3]).unwrap();
        assert!(manager.get_partition(3).is_some());
    }

    #[test]
    fn test_load_expires_unlisted() {
        let dir = tempdir().unwrap();
        {
            let manager = MetadataManager::new(dir.path(), 1).unwrap();
            manager.create_partition(config(3)).unwrap();
            manager.create_partition(config(4)).unwrap();
            manager.stop_all();
        }
        let manager = MetadataManager::new(dir.path(), 1).unwrap();
        manager.load_partitions(&[3]).unwrap();
        assert!(manager.get_partition(3).is_some());
        assert!(manager.get_partition(4).is_none());
        let expired: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(crate::partition::EXPIRED_PARTITION_PREFIX)
            })
            .collect();
        assert_eq!(expired.len(), 1);
    }
}
