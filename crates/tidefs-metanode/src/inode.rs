//! Inode records.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use tidefs_proto::{ExtentKey, InodeInfo, MODE_DIR, MODE_REGULAR};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One inode record in the inode tree. Extent keys are kept in append
/// order; the generation bumps on every extent append and truncate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Inode id, the tree key.
    pub inode: u64,
    /// File mode (regular / dir / symlink).
    pub mode: u32,
    /// Hard link count; directories start at 2.
    pub nlink: u32,
    /// File size in bytes.
    pub size: u64,
    /// Mutation generation.
    pub generation: u64,
    /// Creation time, seconds since epoch.
    pub create_time: u64,
    /// Access time, seconds since epoch.
    pub access_time: u64,
    /// Modification time, seconds since epoch.
    pub modify_time: u64,
    /// Symlink target; empty otherwise.
    pub target: Vec<u8>,
    /// Extent keys in append order.
    pub extents: Vec<ExtentKey>,
    /// Set when the inode is awaiting extent deletion and final removal.
    pub mark_delete: bool,
}

impl Inode {
    /// Creates a fresh inode of the given mode. Directories carry the
    /// POSIX minimum of two links.
    pub fn new(inode: u64, mode: u32) -> Self {
        let now = unix_now();
        Self {
            inode,
            mode,
            nlink: if mode == MODE_DIR { 2 } else { 1 },
            size: 0,
            generation: 0,
            create_time: now,
            access_time: now,
            modify_time: now,
            target: Vec::new(),
            extents: Vec::new(),
            mark_delete: false,
        }
    }

    /// Whether the inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode == MODE_DIR
    }

    /// Whether the inode is a regular file.
    pub fn is_regular(&self) -> bool {
        self.mode == MODE_REGULAR
    }

    /// Appends one extent key, extending the file size to cover it.
    pub fn append_extent(&mut self, key: ExtentKey) {
        self.size = self.size.max(key.file_offset + key.size as u64);
        self.extents.push(key);
    }

    /// The tree key for an inode id.
    pub fn key(inode: u64) -> [u8; 8] {
        inode.to_be_bytes()
    }

    /// Client-facing record.
    pub fn to_info(&self) -> InodeInfo {
        InodeInfo {
            inode: self.inode,
            mode: self.mode,
            nlink: self.nlink,
            size: self.size,
            generation: self.generation,
            modify_time: self.modify_time,
            create_time: self.create_time,
            access_time: self.access_time,
            target: self.target.clone(),
        }
    }
}
