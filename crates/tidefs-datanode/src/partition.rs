//! Replicated data partitions: a directory of extents plus replica
//! bookkeeping, status accounting, and the repair entry points.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tidefs_proto::{LoadDataPartitionResponse, PartitionSnapshotFile, TaskStatus};
use tidefs_storage::{stable_extent_filter, ExtentInfo, ExtentStore};

use crate::cluster::ClusterView;
use crate::disk::Disk;
use crate::error::{DataNodeError, DataNodeResult};
use crate::metrics::DataPartitionMetrics;

/// Directory prefix of every partition under a disk root.
pub const DATA_PARTITION_PREFIX: &str = "datapartition";
/// Partition META file name.
pub const DATA_PARTITION_META_FILE: &str = "META";
/// Extent count at which a partition goes read-only.
pub const MAX_ACTIVE_EXTENTS: usize = 10_000;
/// Replica refresh is rate-limited to once per this many seconds.
pub const UPDATE_REPLICATION_HOSTS_SECS: u64 = 60;
/// Usage recompute is rate-limited to once per this many seconds.
pub const UPDATE_PARTITION_SIZE_SECS: u64 = 300;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Partition availability, ordered so the worst of partition and disk
/// status wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PartitionStatus {
    /// Serving nothing; disk-level failure.
    Unavailable = 0,
    /// Serving reads only.
    ReadOnly = 1,
    /// Serving reads and writes.
    ReadWrite = 2,
}

impl PartitionStatus {
    /// Decodes a status byte, collapsing unknown values to unavailable.
    pub fn from_u8(b: u8) -> Self {
        match b {
            2 => PartitionStatus::ReadWrite,
            1 => PartitionStatus::ReadOnly,
            _ => PartitionStatus::Unavailable,
        }
    }
}

/// JSON META file written beside the extents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPartitionMeta {
    /// Volume the partition belongs to.
    #[serde(rename = "VolumeId")]
    pub volume_id: String,
    /// Partition id.
    #[serde(rename = "PartitionId")]
    pub partition_id: u32,
    /// Partition kind label.
    #[serde(rename = "PartitionType")]
    pub partition_type: String,
    /// Capacity in bytes.
    #[serde(rename = "PartitionSize")]
    pub partition_size: u64,
    /// Creation time, seconds since epoch.
    #[serde(rename = "CreateTime")]
    pub create_time: u64,
}

impl DataPartitionMeta {
    /// Validates the decoded META file.
    pub fn validate(&self) -> DataNodeResult<()> {
        if self.volume_id.trim().is_empty()
            || self.partition_type.trim().is_empty()
            || self.partition_id == 0
            || self.partition_size == 0
        {
            return Err(DataNodeError::IllegalMeta(format!(
                "volume={:?} type={:?} id={} size={}",
                self.volume_id, self.partition_type, self.partition_id, self.partition_size
            )));
        }
        Ok(())
    }
}

/// A replicated group member: one extent store plus replica bookkeeping.
pub struct DataPartition {
    volume_id: String,
    partition_id: u32,
    partition_size: u64,
    path: PathBuf,
    disk: Arc<Disk>,
    store: ExtentStore,
    status: AtomicU8,
    is_leader: AtomicBool,
    replica_hosts: RwLock<Vec<String>>,
    used: AtomicU64,
    metrics: DataPartitionMetrics,
    last_replica_update: AtomicU64,
    last_usage_update: AtomicU64,
}

impl DataPartition {
    /// Creates a partition directory under `disk`, persisting its META
    /// file.
    pub fn create(
        volume_id: &str,
        partition_id: u32,
        partition_size: u64,
        partition_type: &str,
        disk: Arc<Disk>,
    ) -> DataNodeResult<Arc<Self>> {
        let partition = Self::new(volume_id, partition_id, partition_size, disk)?;
        let meta = DataPartitionMeta {
            volume_id: volume_id.to_string(),
            partition_id,
            partition_type: partition_type.to_string(),
            partition_size,
            create_time: unix_now(),
        };
        meta.validate()?;
        let meta_path = partition.path.join(DATA_PARTITION_META_FILE);
        let mut meta_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(meta_path)?;
        meta_file.write_all(&serde_json::to_vec(&meta)?)?;
        meta_file.sync_all()?;
        info!(partition_id, volume_id, partition_size, "data partition created");
        Ok(partition)
    }

    /// Loads a partition from an existing directory by reading and
    /// validating its META file.
    pub fn load(partition_dir: &Path, disk: Arc<Disk>) -> DataNodeResult<Arc<Self>> {
        let raw = fs::read(partition_dir.join(DATA_PARTITION_META_FILE))?;
        let meta: DataPartitionMeta = serde_json::from_slice(&raw)?;
        meta.validate()?;
        Self::new(&meta.volume_id, meta.partition_id, meta.partition_size, disk)
    }

    fn new(
        volume_id: &str,
        partition_id: u32,
        partition_size: u64,
        disk: Arc<Disk>,
    ) -> DataNodeResult<Arc<Self>> {
        let path = disk.path().join(format!(
            "{}_{}_{}",
            DATA_PARTITION_PREFIX, partition_id, partition_size
        ));
        let store = ExtentStore::open(&path, partition_size)?;
        Ok(Arc::new(Self {
            volume_id: volume_id.to_string(),
            partition_id,
            partition_size,
            path,
            disk,
            store,
            status: AtomicU8::new(PartitionStatus::ReadWrite as u8),
            is_leader: AtomicBool::new(false),
            replica_hosts: RwLock::new(Vec::new()),
            used: AtomicU64::new(0),
            metrics: DataPartitionMetrics::new(),
            last_replica_update: AtomicU64::new(0),
            last_usage_update: AtomicU64::new(0),
        }))
    }

    /// Partition id.
    pub fn id(&self) -> u32 {
        self.partition_id
    }

    /// Volume the partition belongs to.
    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    /// Partition directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capacity in bytes.
    pub fn size(&self) -> u64 {
        self.partition_size
    }

    /// Bytes consumed by entry files at the last usage pass.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Remaining capacity in bytes.
    pub fn available(&self) -> u64 {
        self.partition_size.saturating_sub(self.used())
    }

    /// Current status.
    pub fn status(&self) -> PartitionStatus {
        PartitionStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Hosting disk.
    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    /// Whether this replica currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// Replica hosts, leader first.
    pub fn replica_hosts(&self) -> Vec<String> {
        self.replica_hosts.read().unwrap().clone()
    }

    /// Backing extent store.
    pub fn store(&self) -> &ExtentStore {
        &self.store
    }

    /// Runtime latency metrics.
    pub fn metrics(&self) -> &DataPartitionMetrics {
        &self.metrics
    }

    /// Admission check ahead of any write or create.
    pub fn check_writable(&self) -> DataNodeResult<()> {
        if self.available() == 0 {
            return Err(DataNodeError::NoSpace);
        }
        if self.disk.status() != PartitionStatus::ReadWrite {
            return Err(DataNodeError::NoSpace);
        }
        Ok(())
    }

    /// Recomputes usage and derives the partition status: read-write
    /// unless the partition is full or carries too many extents, capped
    /// by the disk status.
    pub fn status_update(&self) {
        self.compute_usage();
        let mut status = PartitionStatus::ReadWrite;
        if self.used() >= self.partition_size {
            status = PartitionStatus::ReadOnly;
        }
        if self.store.extent_count() >= MAX_ACTIVE_EXTENTS {
            status = PartitionStatus::ReadOnly;
        }
        let capped = status.min(self.disk.status());
        self.status.store(capped as u8, Ordering::Relaxed);
    }

    /// Sums entry-file sizes, rate-limited to once per
    /// [`UPDATE_PARTITION_SIZE_SECS`].
    pub fn compute_usage(&self) {
        let now = unix_now();
        if now.saturating_sub(self.last_usage_update.load(Ordering::Relaxed))
            < UPDATE_PARTITION_SIZE_SECS
            && self.last_usage_update.load(Ordering::Relaxed) != 0
        {
            return;
        }
        self.used.store(self.store.used_size(), Ordering::Relaxed);
        self.last_usage_update.store(now, Ordering::Relaxed);
    }

    /// Refreshes the replica set from the cluster view, rate-limited to
    /// once per [`UPDATE_REPLICATION_HOSTS_SECS`]. Leadership is holding
    /// index 0 of the replica list.
    pub fn update_replica_hosts(&self, view: &dyn ClusterView) -> DataNodeResult<()> {
        let now = unix_now();
        let last = self.last_replica_update.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) <= UPDATE_REPLICATION_HOSTS_SECS {
            return Ok(());
        }
        self.is_leader.store(false, Ordering::Relaxed);
        let hosts = view.data_partition_hosts(self.partition_id)?;
        {
            let mut current = self.replica_hosts.write().unwrap();
            if *current != hosts {
                info!(
                    partition_id = self.partition_id,
                    from = ?*current,
                    to = ?hosts,
                    "replica hosts changed"
                );
            }
            *current = hosts.clone();
        }
        let is_leader = hosts
            .first()
            .map(|leader| *leader == view.local_addr())
            .unwrap_or(false);
        self.is_leader.store(is_leader, Ordering::Relaxed);
        self.last_replica_update.store(now, Ordering::Relaxed);
        debug!(partition_id = self.partition_id, is_leader, "replica hosts refreshed");
        Ok(())
    }

    /// Stable extent watermarks for repair comparison.
    pub fn all_watermarks(&self) -> Vec<ExtentInfo> {
        self.store.get_all_watermark(Some(&stable_extent_filter()))
    }

    /// Snapshot served to the controller's load task.
    pub fn load_response(&self) -> LoadDataPartitionResponse {
        let snapshot = self
            .all_watermarks()
            .into_iter()
            .map(|info| PartitionSnapshotFile {
                name: info.extent_id.to_string(),
                crc: info.crc,
                size: info.size,
                mark_del: info.deleted,
                modified: info.modified,
            })
            .collect();
        LoadDataPartitionResponse {
            partition_id: self.partition_id as u64,
            partition_status: self.status() as u8,
            used: self.used(),
            partition_snapshot: snapshot,
            status: TaskStatus::Success,
            result: String::new(),
        }
    }

    /// Flushes the delete log; see [`ExtentStore::flush_delete`].
    pub fn flush_delete(&self) -> DataNodeResult<()> {
        self.store.flush_delete()?;
        Ok(())
    }

    /// Stops the partition: closes the store (flushing caches and
    /// fsyncing the meta and delete files).
    pub fn stop(&self) {
        self.store.close();
    }
}

/// Parses `datapartition_<id>_<size>` directory names.
pub fn parse_partition_dir_name(name: &str) -> Option<(u32, u64)> {
    let rest = name.strip_prefix(DATA_PARTITION_PREFIX)?.strip_prefix('_')?;
    let mut parts = rest.splitn(2, '_');
    let id = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    Some((id, size))
}
