//! Disk state shared by the partitions it hosts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use tracing::warn;

use crate::partition::PartitionStatus;

/// Read/write errors tolerated before a disk is demoted to unavailable.
pub const MAX_DISK_ERRS: u64 = 2000;

/// One local disk hosting data partitions. Disk status caps the status of
/// every partition on it.
pub struct Disk {
    path: PathBuf,
    capacity: u64,
    status: AtomicU8,
    write_errs: AtomicU64,
    read_errs: AtomicU64,
}

impl Disk {
    /// Registers a disk rooted at `path` with a configured capacity.
    pub fn new(path: &Path, capacity: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            capacity,
            status: AtomicU8::new(PartitionStatus::ReadWrite as u8),
            write_errs: AtomicU64::new(0),
            read_errs: AtomicU64::new(0),
        }
    }

    /// Root directory of the disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current disk status.
    pub fn status(&self) -> PartitionStatus {
        PartitionStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Overrides the disk status.
    pub fn set_status(&self, status: PartitionStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    /// Counts an I/O error against the disk; repeated failures demote it
    /// to unavailable.
    pub fn record_error(&self, write: bool) {
        let total = if write {
            self.write_errs.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.read_errs.fetch_add(1, Ordering::Relaxed) + 1
        };
        if total >= MAX_DISK_ERRS && self.status() != PartitionStatus::Unavailable {
            warn!(disk = %self.path.display(), errors = total, "disk demoted to unavailable");
            self.set_status(PartitionStatus::Unavailable);
        }
    }

    /// Accumulated error counters `(write, read)`.
    pub fn error_counts(&self) -> (u64, u64) {
        (
            self.write_errs.load(Ordering::Relaxed),
            self.read_errs.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_demotes_after_repeated_errors() {
        let disk = Disk::new(Path::new("/tmp/fake"), 1 << 40);
        assert_eq!(disk.status(), PartitionStatus::ReadWrite);
        for _ in 0..MAX_DISK_ERRS {
            disk.record_error(true);
        }
        assert_eq!(disk.status(), PartitionStatus::Unavailable);
    }

    #[test]
    fn test_single_error_keeps_status() {
        let disk = Disk::new(Path::new("/tmp/fake"), 1 << 40);
        disk.record_error(false);
        assert_eq!(disk.status(), PartitionStatus::ReadWrite);
    }
}
