//! The space manager: disks and the partitions mounted on them.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use tidefs_proto::PartitionReport;

use crate::disk::Disk;
use crate::error::{DataNodeError, DataNodeResult};
use crate::partition::{parse_partition_dir_name, DataPartition, PartitionStatus};

/// Owns every disk this node serves and the partition map across them.
pub struct SpaceManager {
    disks: RwLock<Vec<Arc<Disk>>>,
    partitions: RwLock<HashMap<u32, Arc<DataPartition>>>,
}

impl SpaceManager {
    /// Creates an empty space manager.
    pub fn new() -> Self {
        Self {
            disks: RwLock::new(Vec::new()),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a disk and loads every partition directory found on it.
    pub fn add_disk(&self, path: &Path, capacity: u64) -> DataNodeResult<Arc<Disk>> {
        fs::create_dir_all(path)?;
        let disk = Arc::new(Disk::new(path, capacity));
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name();
            if parse_partition_dir_name(&name.to_string_lossy()).is_none() {
                continue;
            }
            match DataPartition::load(&entry.path(), Arc::clone(&disk)) {
                Ok(partition) => {
                    info!(partition_id = partition.id(), disk = %path.display(), "partition loaded");
                    self.partitions
                        .write()
                        .unwrap()
                        .insert(partition.id(), partition);
                }
                Err(e) => {
                    warn!(dir = %entry.path().display(), error = %e, "partition load failed");
                }
            }
        }
        self.disks.write().unwrap().push(Arc::clone(&disk));
        Ok(disk)
    }

    fn pick_disk(&self, partition_size: u64) -> DataNodeResult<Arc<Disk>> {
        let disks = self.disks.read().unwrap();
        let mut best: Option<(u64, Arc<Disk>)> = None;
        for disk in disks.iter() {
            if disk.status() != PartitionStatus::ReadWrite {
                continue;
            }
            let committed: u64 = self
                .partitions
                .read()
                .unwrap()
                .values()
                .filter(|p| Arc::ptr_eq(p.disk(), disk))
                .map(|p| p.size())
                .sum();
            let free = disk.capacity().saturating_sub(committed);
            if free < partition_size {
                continue;
            }
            if best.as_ref().map(|(f, _)| free > *f).unwrap_or(true) {
                best = Some((free, Arc::clone(disk)));
            }
        }
        best.map(|(_, d)| d).ok_or(DataNodeError::NoSpace)
    }

    /// Creates a partition on the roomiest writable disk. Re-creating an
    /// existing id returns the mounted partition.
    pub fn create_partition(
        &self,
        volume_id: &str,
        partition_id: u32,
        partition_size: u64,
        partition_type: &str,
    ) -> DataNodeResult<Arc<DataPartition>> {
        if let Some(existing) = self.get_partition(partition_id) {
            return Ok(existing);
        }
        let disk = self.pick_disk(partition_size)?;
        let partition =
            DataPartition::create(volume_id, partition_id, partition_size, partition_type, disk)?;
        self.partitions
            .write()
            .unwrap()
            .insert(partition_id, Arc::clone(&partition));
        Ok(partition)
    }

    /// Looks a mounted partition up.
    pub fn get_partition(&self, partition_id: u32) -> Option<Arc<DataPartition>> {
        self.partitions.read().unwrap().get(&partition_id).cloned()
    }

    /// Unmounts a partition and removes its on-disk directory.
    pub fn delete_partition(&self, partition_id: u32) -> DataNodeResult<()> {
        let partition = self
            .partitions
            .write()
            .unwrap()
            .remove(&partition_id)
            .ok_or(DataNodeError::PartitionNotFound(partition_id))?;
        partition.stop();
        partition.store().delete_store()?;
        let _ = fs::remove_dir_all(partition.path());
        info!(partition_id, "partition deleted");
        Ok(())
    }

    /// Every mounted partition.
    pub fn partitions(&self) -> Vec<Arc<DataPartition>> {
        self.partitions.read().unwrap().values().cloned().collect()
    }

    /// `(total, used)` bytes across disks for the heartbeat.
    pub fn totals(&self) -> (u64, u64) {
        let total = self
            .disks
            .read()
            .unwrap()
            .iter()
            .map(|d| d.capacity())
            .sum();
        let used = self.partitions().iter().map(|p| p.used()).sum();
        (total, used)
    }

    /// Per-partition usage lines for the heartbeat.
    pub fn partition_reports(&self) -> Vec<PartitionReport> {
        self.partitions()
            .iter()
            .map(|p| PartitionReport {
                partition_id: p.id() as u64,
                partition_status: p.status() as u8,
                total: p.size(),
                used: p.used(),
                extent_count: p.store().extent_count() as u64,
                is_leader: p.is_leader(),
            })
            .collect()
    }

    /// Stops every partition.
    pub fn stop_all(&self) {
        for partition in self.partitions() {
            partition.stop();
        }
    }
}

impl Default for SpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_reload_partition() {
        let dir = tempdir().unwrap();
        {
            let space = SpaceManager::new();
            space.add_disk(dir.path(), 1 << 40).unwrap();
            let partition = space.create_partition("vol1", 7, 1 << 30, "extent").unwrap();
            assert_eq!(partition.id(), 7);
            // Idempotent create returns the mounted instance.
            let again = space.create_partition("vol1", 7, 1 << 30, "extent").unwrap();
            assert!(Arc::ptr_eq(&partition, &again));
            space.stop_all();
        }
        let space = SpaceManager::new();
        space.add_disk(dir.path(), 1 << 40).unwrap();
        let partition = space.get_partition(7).expect("partition reloaded from disk");
        assert_eq!(partition.volume_id(), "vol1");
    }

    #[test]
    fn test_delete_partition_removes_directory() {
        let dir = tempdir().unwrap();
        let space = SpaceManager::new();
        space.add_disk(dir.path(), 1 << 40).unwrap();
        let partition = space.create_partition("vol1", 3, 1 << 30, "extent").unwrap();
        let path = partition.path().to_path_buf();
        drop(partition);
        space.delete_partition(3).unwrap();
        assert!(!path.exists());
        assert!(space.get_partition(3).is_none());
        assert!(matches!(
            space.delete_partition(3),
            Err(DataNodeError::PartitionNotFound(3))
        ));
    }

    #[test]
    fn test_create_without_disk_is_no_space() {
        let space = SpaceManager::new();
        assert!(matches!(
            space.create_partition("vol1", 1, 1 << 30, "extent"),
            Err(DataNodeError::NoSpace)
        ));
    }

    #[test]
    fn test_reports_and_totals() {
        let dir = tempdir().unwrap();
        let space = SpaceManager::new();
        space.add_disk(dir.path(), 1 << 40).unwrap();
        space.create_partition("vol1", 1, 1 << 30, "extent").unwrap();
        space.create_partition("vol1", 2, 1 << 30, "extent").unwrap();
        let (total, _used) = space.totals();
        assert_eq!(total, 1 << 40);
        let reports = space.partition_reports();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().any(|r| r.partition_id == 1));
    }
}
