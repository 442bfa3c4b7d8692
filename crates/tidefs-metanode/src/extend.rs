//! Extended attributes: one record per inode holding its name → value
//! map.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One inode's extended attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extend {
    /// Owning inode, the tree key.
    pub inode: u64,
    /// Attribute name → value, name-ordered.
    pub attrs: BTreeMap<String, Vec<u8>>,
}

impl Extend {
    /// Creates an empty attribute record for an inode.
    pub fn new(inode: u64) -> Self {
        Self {
            inode,
            attrs: BTreeMap::new(),
        }
    }

    /// The tree key for an inode id.
    pub fn key(inode: u64) -> [u8; 8] {
        inode.to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrs_sorted() {
        let mut ext = Extend::new(5);
        ext.attrs.insert("user.b".into(), b"2".to_vec());
        ext.attrs.insert("user.a".into(), b"1".to_vec());
        let keys: Vec<&String> = ext.attrs.keys().collect();
        assert_eq!(keys, ["user.a", "user.b"]);
    }
}
