#![warn(missing_docs)]

//! TideFS wire protocol: the length-delimited packet frame shared by all
//! tiers, the opcode and result-code tables, extent keys, and the JSON
//! message bodies exchanged with the metadata tier and the cluster
//! controller.

pub mod crc;
pub mod error;
pub mod extent_key;
pub mod meta;
pub mod opcode;
pub mod packet;
pub mod task;

pub use crc::crc32;
pub use error::{ProtoError, ProtoResult};
pub use extent_key::ExtentKey;
pub use meta::{
    AppendExtentKeyRequest, AppendMultipartRequest, BatchGetXAttrRequest, BatchGetXAttrResponse,
    BatchInodeGetRequest, BatchInodeGetResponse, CreateDentryRequest, CreateInodeRequest, CreateInodeResponse,
    CreateMultipartRequest, CreateMultipartResponse, DeleteDentryRequest, DeleteDentryResponse,
    DeleteInodeRequest, DeleteInodeResponse, DentryItem, EvictInodeRequest, GetExtentsRequest,
    GetExtentsResponse, GetMultipartRequest, GetMultipartResponse, GetXAttrRequest,
    GetXAttrResponse, InodeGetRequest, InodeGetResponse, InodeInfo, LinkInodeRequest,
    LinkInodeResponse, ListMultipartRequest, ListMultipartResponse, ListXAttrRequest,
    ListXAttrResponse, LookupRequest, LookupResponse, MultipartInfo, MultipartPartInfo,
    ReadDirRequest, ReadDirResponse, RemoveMultipartRequest, RemoveXAttrRequest, SetAttrRequest,
    SetXAttrRequest, TruncateRequest, TruncateResponse, UpdateDentryRequest, UpdateDentryResponse,
    XAttrInfo, MODE_DIR, MODE_REGULAR, MODE_SYMLINK, ROOT_INODE,
};
pub use opcode::{Opcode, ResultCode, StoreMode};
pub use packet::{Packet, PACKET_HEADER_SIZE, PACKET_MAGIC};
pub use task::{
    AdminTask, CreateDataPartitionRequest, DataPartitionMetricsResponse,
    DeleteDataPartitionRequest, DeleteDataPartitionResponse, HeartbeatRequest, HeartbeatResponse,
    LoadDataPartitionRequest, LoadDataPartitionResponse, PartitionReport, PartitionSnapshotFile,
    TaskStatus,
};

/// First extent id of the tiny-extent pool.
pub const TINY_EXTENT_START_ID: u64 = 50_000_000;
/// Number of tiny extents pre-allocated per data partition.
pub const TINY_EXTENT_COUNT: u64 = 128;
/// Smallest allocatable normal extent id; ids 0 and 1 are reserved.
pub const MIN_EXTENT_ID: u64 = 2;

/// Returns true if the extent id falls inside the reserved tiny-extent pool.
pub fn is_tiny_extent(extent_id: u64) -> bool {
    (TINY_EXTENT_START_ID..TINY_EXTENT_START_ID + TINY_EXTENT_COUNT).contains(&extent_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny_extent_range() {
        assert!(!is_tiny_extent(0));
        assert!(!is_tiny_extent(MIN_EXTENT_ID));
        assert!(!is_tiny_extent(TINY_EXTENT_START_ID - 1));
        assert!(is_tiny_extent(TINY_EXTENT_START_ID));
        assert!(is_tiny_extent(TINY_EXTENT_START_ID + TINY_EXTENT_COUNT - 1));
        assert!(!is_tiny_extent(TINY_EXTENT_START_ID + TINY_EXTENT_COUNT));
    }
}
