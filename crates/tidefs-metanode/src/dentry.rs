//! Directory entries.

use serde::{Deserialize, Serialize};

/// One directory entry: `(parent, name) → child inode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dentry {
    /// Parent directory inode.
    pub parent_id: u64,
    /// Entry name.
    pub name: String,
    /// Child inode.
    pub inode: u64,
    /// Child file mode.
    pub type_: u32,
}

impl Dentry {
    /// The tree key for `(parent, name)`: big-endian parent id followed
    /// by the raw name, so one directory's entries are contiguous and
    /// name-ordered.
    pub fn key(parent_id: u64, name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + name.len());
        key.extend_from_slice(&parent_id.to_be_bytes());
        key.extend_from_slice(name.as_bytes());
        key
    }

    /// `[start, end)` keys covering every entry of one directory.
    pub fn dir_range(parent_id: u64) -> (Vec<u8>, Vec<u8>) {
        (
            Dentry::key(parent_id, ""),
            Dentry::key(parent_id + 1, ""),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_groups_by_parent_then_name() {
        assert!(Dentry::key(1, "a") < Dentry::key(1, "b"));
        assert!(Dentry::key(1, "zzz") < Dentry::key(2, "a"));
    }

    #[test]
    fn test_dir_range_covers_only_one_parent() {
        let (start, end) = Dentry::dir_range(1);
        let inside = Dentry::key(1, "anything");
        let outside = Dentry::key(2, "a");
        assert!(start <= inside && inside < end);
        assert!(outside >= end);
    }
}
