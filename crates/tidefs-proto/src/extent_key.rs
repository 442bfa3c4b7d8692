//! Extent keys: the pointer an inode stores for each byte range of file
//! content living on a data partition.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtoError;

/// Identifies one byte range of a file's content on one data partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentKey {
    /// Owning data partition.
    pub partition_id: u32,
    /// Extent entry file within the partition.
    pub extent_id: u64,
    /// Byte offset of the range inside the extent.
    pub extent_offset: u64,
    /// Length of the range in bytes.
    pub size: u32,
    /// Byte offset of the range inside the file.
    pub file_offset: u64,
}

impl ExtentKey {
    /// Width of the fixed binary encoding in bytes.
    pub const BINARY_SIZE: usize = 4 + 8 + 8 + 4 + 8;

    /// Encodes the key as big-endian fixed-width binary, appending to `buf`.
    pub fn marshal_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.partition_id.to_be_bytes());
        buf.extend_from_slice(&self.extent_id.to_be_bytes());
        buf.extend_from_slice(&self.extent_offset.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.file_offset.to_be_bytes());
    }

    /// Decodes one key from the front of `buf`.
    pub fn unmarshal(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::BINARY_SIZE {
            return Err(ProtoError::TruncatedRecord {
                need: Self::BINARY_SIZE,
                have: buf.len(),
            });
        }
        let partition_id = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let extent_id = u64::from_be_bytes(buf[4..12].try_into().unwrap());
        let extent_offset = u64::from_be_bytes(buf[12..20].try_into().unwrap());
        let size = u32::from_be_bytes(buf[20..24].try_into().unwrap());
        let file_offset = u64::from_be_bytes(buf[24..32].try_into().unwrap());
        Ok(Self {
            partition_id,
            extent_id,
            extent_offset,
            size,
            file_offset,
        })
    }
}

impl fmt::Display for ExtentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.partition_id, self.extent_id, self.extent_offset, self.size, self.file_offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_unmarshal() {
        let key = ExtentKey {
            partition_id: 7,
            extent_id: 50_000_001,
            extent_offset: 8192,
            size: 4096,
            file_offset: 1 << 30,
        };
        let mut buf = Vec::new();
        key.marshal_into(&mut buf);
        assert_eq!(buf.len(), ExtentKey::BINARY_SIZE);
        let decoded = ExtentKey::unmarshal(&buf).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_unmarshal_truncated() {
        let err = ExtentKey::unmarshal(&[0u8; 10]).unwrap_err();
        match err {
            ProtoError::TruncatedRecord { need, have } => {
                assert_eq!(need, ExtentKey::BINARY_SIZE);
                assert_eq!(have, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let key = ExtentKey {
            partition_id: 1,
            extent_id: 2,
            extent_offset: 0,
            size: 131072,
            file_offset: 0,
        };
        let encoded = serde_json::to_vec(&key).unwrap();
        let decoded: ExtentKey = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, key);
    }
}
