//! Multipart upload records.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use tidefs_proto::{MultipartInfo, MultipartPartInfo};

/// One uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Part number, 1-based.
    pub id: u16,
    /// Inode holding the part's data.
    pub inode: u64,
    /// Hex digest of the part's content.
    pub md5: String,
    /// Part size in bytes.
    pub size: u64,
    /// Upload time, seconds since epoch.
    pub upload_time: u64,
}

/// One multipart upload keyed by `(path, upload id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multipart {
    /// Object path the upload targets.
    pub path: String,
    /// Upload id.
    pub id: String,
    /// Initiation time, seconds since epoch.
    pub init_time: u64,
    /// Parts in part-number order.
    pub parts: Vec<Part>,
    /// User metadata attached at initiation, name-ordered so the stored
    /// encoding is identical on every replica.
    pub extend: BTreeMap<String, String>,
}

impl Multipart {
    /// Creates a fresh upload record.
    pub fn new(path: &str, id: &str, extend: HashMap<String, String>) -> Self {
        Self {
            path: path.to_string(),
            id: id.to_string(),
            init_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            parts: Vec::new(),
            extend: extend.into_iter().collect(),
        }
    }

    /// Inserts a part keeping the list part-number ordered; a duplicate
    /// part number replaces the previous upload of that part.
    pub fn insert_part(&mut self, part: Part) {
        match self.parts.binary_search_by_key(&part.id, |p| p.id) {
            Ok(pos) => self.parts[pos] = part,
            Err(pos) => self.parts.insert(pos, part),
        }
    }

    /// The tree key for `(path, id)`: the path, a NUL separator, then
    /// the upload id, so uploads list path-ordered and prefix scans
    /// work on the path alone.
    pub fn key(path: &str, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(path.len() + 1 + id.len());
        key.extend_from_slice(path.as_bytes());
        key.push(0);
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Client-facing record.
    pub fn to_info(&self) -> MultipartInfo {
        MultipartInfo {
            id: self.id.clone(),
            path: self.path.clone(),
            init_time: self.init_time,
            parts: self
                .parts
                .iter()
                .map(|p| MultipartPartInfo {
                    id: p.id,
                    inode: p.inode,
                    md5: p.md5.clone(),
                    size: p.size,
                    upload_time: p.upload_time,
                })
                .collect(),
            extend: self.extend.clone().into_iter().collect(),
        }
    }
}

/// Generates an upload id: the partition id in hex followed by 16 random
/// bytes. Uniqueness is probabilistic; the tree's create semantics
/// reject the astronomically unlikely exact duplicate.
pub fn create_multipart_id(partition_id: u64) -> String {
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    let mut id = format!("{partition_id:016x}");
    for byte in random {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}
