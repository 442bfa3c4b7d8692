//! Extent watermarks and the filters used to select them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::extent::Extent;

/// Snapshot of one extent's identity and size, used for cross-replica
/// comparison during repair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentInfo {
    /// Extent id.
    #[serde(rename = "fileId")]
    pub extent_id: u64,
    /// Owner inode stamp.
    #[serde(rename = "ino")]
    pub inode: u64,
    /// Data length in bytes.
    pub size: u64,
    /// Header checksum over the populated block CRCs.
    pub crc: u32,
    /// Whether the extent is tombstoned.
    pub deleted: bool,
    /// Last modification, seconds since epoch.
    #[serde(rename = "modTime")]
    pub modified: u64,
    /// Repair source address, empty outside repair tasks.
    #[serde(rename = "src", default)]
    pub source: String,
}

impl ExtentInfo {
    /// Refreshes this record from a live extent handle. Header-derived
    /// fields stay zero for tiny extents, which have no header.
    pub fn from_extent(&mut self, extent: &Extent) {
        self.extent_id = extent.id();
        self.inode = extent.ino();
        self.size = extent.size();
        if !extent.is_tiny() {
            self.deleted = extent.is_mark_delete();
            self.modified = extent.modified();
            self.crc = extent.header_checksum();
        }
    }
}

impl fmt::Display for ExtentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = if self.source.is_empty() {
            "none"
        } else {
            &self.source
        };
        write!(
            f,
            "{}_{}_{}_{}_{}_{}",
            self.extent_id, self.inode, self.size, self.crc, self.deleted, source
        )
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Selects stable normal extents for repair watermarks: older than ten
/// minutes, not tombstoned, non-empty.
pub fn stable_extent_filter() -> impl Fn(&ExtentInfo) -> bool {
    let now = unix_now();
    move |info: &ExtentInfo| {
        !tidefs_proto::is_tiny_extent(info.extent_id)
            && now.saturating_sub(info.modified) > 10 * 60
            && !info.deleted
            && info.size > 0
    }
}

/// Selects empty normal extents eligible for dirty-create reclamation:
/// older than one hour, not tombstoned, zero size.
pub fn empty_extent_filter() -> impl Fn(&ExtentInfo) -> bool {
    let now = unix_now();
    move |info: &ExtentInfo| {
        !tidefs_proto::is_tiny_extent(info.extent_id)
            && now.saturating_sub(info.modified) > 60 * 60
            && !info.deleted
            && info.size == 0
    }
}

/// Selects the tiny extents named in `ids`.
pub fn tiny_extent_filter(ids: Vec<u64>) -> impl Fn(&ExtentInfo) -> bool {
    move |info: &ExtentInfo| {
        tidefs_proto::is_tiny_extent(info.extent_id) && ids.contains(&info.extent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(extent_id: u64, size: u64, age_secs: u64, deleted: bool) -> ExtentInfo {
        ExtentInfo {
            extent_id,
            inode: 1,
            size,
            crc: 0,
            deleted,
            modified: unix_now().saturating_sub(age_secs),
            source: String::new(),
        }
    }

    #[test]
    fn test_stable_filter() {
        let f = stable_extent_filter();
        assert!(f(&info(2, 100, 11 * 60, false)));
        assert!(!f(&info(2, 100, 60, false)), "too young");
        assert!(!f(&info(2, 0, 11 * 60, false)), "empty");
        assert!(!f(&info(2, 100, 11 * 60, true)), "tombstoned");
        assert!(
            !f(&info(tidefs_proto::TINY_EXTENT_START_ID, 100, 11 * 60, false)),
            "tiny"
        );
    }

    #[test]
    fn test_empty_filter() {
        let f = empty_extent_filter();
        assert!(f(&info(2, 0, 2 * 60 * 60, false)));
        assert!(!f(&info(2, 100, 2 * 60 * 60, false)));
        assert!(!f(&info(2, 0, 30 * 60, false)));
    }

    #[test]
    fn test_tiny_filter() {
        let base = tidefs_proto::TINY_EXTENT_START_ID;
        let f = tiny_extent_filter(vec![base, base + 5]);
        assert!(f(&info(base, 10, 0, false)));
        assert!(!f(&info(base + 1, 10, 0, false)));
        assert!(!f(&info(2, 10, 0, false)));
    }

    #[test]
    fn test_info_display() {
        let i = info(2, 100, 0, false);
        assert!(format!("{i}").ends_with("_none"));
    }
}
