#![warn(missing_docs)]

//! TideFS extent storage engine.
//!
//! One extent is one entry file on a local disk: normal extents carry a
//! fixed header (owner inode stamp, per-block CRC table, tombstone byte)
//! followed by up to 128 MiB of data; tiny extents are headerless
//! pre-allocated files that accept sub-extent writes and page-aligned
//! hole-punch deletes. An [`ExtentStore`] owns one directory of extents
//! per data partition, together with the id allocator, the delete log,
//! the tiny-extent availability queues, and an LRU of open handles.

pub mod cache;
pub mod error;
pub mod extent;
pub mod info;
pub mod store;

pub use cache::ExtentCache;
pub use error::{StorageError, StorageResult};
pub use extent::Extent;
pub use info::{empty_extent_filter, stable_extent_filter, tiny_extent_filter, ExtentInfo};
pub use store::ExtentStore;

pub use tidefs_proto::{crc32, is_tiny_extent, MIN_EXTENT_ID, TINY_EXTENT_COUNT, TINY_EXTENT_START_ID};

/// Bytes per CRC-covered block.
pub const BLOCK_SIZE: u64 = 128 * 1024;
/// Blocks per extent.
pub const BLOCK_COUNT: u64 = 1024;
/// Maximum extent data length (128 MiB).
pub const EXTENT_SIZE_LIMIT: u64 = BLOCK_SIZE * BLOCK_COUNT;
/// Hole-punch granularity for tiny extents.
pub const PAGE_SIZE: u64 = 4096;

/// Width of the owner inode stamp at the head of a normal extent.
pub const HEADER_INO_SIZE: usize = 8;
/// Offset of the per-block CRC table inside the header.
pub const HEADER_CRC_OFFSET: usize = HEADER_INO_SIZE;
/// Width of one CRC table entry.
pub const PER_BLOCK_CRC_SIZE: usize = 4;
/// Offset of the tombstone byte, just past the CRC table.
pub const MARK_DELETE_INDEX: usize = HEADER_CRC_OFFSET + BLOCK_COUNT as usize * PER_BLOCK_CRC_SIZE;
/// Tombstone byte value.
pub const MARK_DELETE: u8 = 0xFF;
/// Full header width of a normal extent.
pub const EXTENT_HEADER_SIZE: usize = MARK_DELETE_INDEX + 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_CRC_OFFSET, 8);
        assert_eq!(MARK_DELETE_INDEX, 8 + 4096);
        assert_eq!(EXTENT_HEADER_SIZE, 4105);
        assert_eq!(EXTENT_SIZE_LIMIT, 128 * 1024 * 1024);
    }
}
