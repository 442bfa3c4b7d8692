//! Opcode, result-code, and store-mode tables for the packet frame.

use std::fmt;

use crate::error::ProtoError;

/// Extent flavor addressed by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreMode {
    /// Normal extent: append-mostly, whole-extent delete.
    Normal = 1,
    /// Tiny extent: sub-extent writes, page-aligned hole-punch deletes.
    Tiny = 2,
}

impl StoreMode {
    /// Decodes a store mode from its wire byte.
    pub fn from_u8(b: u8) -> Result<Self, ProtoError> {
        match b {
            1 => Ok(StoreMode::Normal),
            2 => Ok(StoreMode::Tiny),
            other => Err(ProtoError::UnknownStoreMode(other)),
        }
    }
}

/// Operations carried in the packet frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Create an extent entry file.
    CreateFile = 0x01,
    /// Mark an extent deleted (whole-extent or tiny hole punch).
    MarkDelete = 0x02,
    /// Write a byte range into an extent.
    Write = 0x03,
    /// Read a byte range from an extent.
    Read = 0x04,
    /// Read a large range as a stream of independently CRC'd reply packets.
    StreamRead = 0x05,
    /// Fetch a single extent's watermark.
    GetWatermark = 0x06,
    /// Fetch every stable extent's watermark from a store.
    ExtentStoreGetAllWatermark = 0x07,
    /// Push a repair task set to a follower.
    NotifyExtentRepair = 0x08,
    /// Master task: create a data partition.
    CreateDataPartition = 0x09,
    /// Master task: load a data partition and return its snapshot.
    LoadDataPartition = 0x0A,
    /// Master task: delete a data partition.
    DeleteDataPartition = 0x0B,
    /// Master task: data node heartbeat.
    DataNodeHeartbeat = 0x0C,
    /// Fetch a partition's runtime metrics.
    GetDataPartitionMetrics = 0x0D,

    /// Create an inode.
    MetaCreateInode = 0x20,
    /// Create a dentry.
    MetaCreateDentry = 0x21,
    /// Decrement an inode's link count.
    MetaUnlinkInode = 0x22,
    /// Evict an inode whose links are gone.
    MetaEvictInode = 0x23,
    /// Look a name up in a directory.
    MetaLookup = 0x24,
    /// Fetch one inode record.
    MetaInodeGet = 0x25,
    /// Fetch a batch of inode records.
    MetaBatchInodeGet = 0x26,
    /// Scan a directory's dentries.
    MetaReadDir = 0x27,
    /// Append an extent key to an inode.
    MetaExtentsAdd = 0x28,
    /// List an inode's extent keys.
    MetaExtentsList = 0x29,
    /// Truncate an inode's extents.
    MetaTruncate = 0x2A,
    /// Increment an inode's link count.
    MetaLinkInode = 0x2B,
    /// Atomic rename at the same parent: swap target inode numbers.
    MetaUpdateDentry = 0x2C,
    /// Delete a dentry.
    MetaDeleteDentry = 0x2D,
    /// Set inode attributes.
    MetaSetAttr = 0x2E,
    /// Set an extended attribute.
    MetaSetXAttr = 0x30,
    /// Get an extended attribute.
    MetaGetXAttr = 0x31,
    /// List extended attribute names.
    MetaListXAttr = 0x32,
    /// Remove an extended attribute.
    MetaRemoveXAttr = 0x33,
    /// Get extended attributes for a batch of inodes.
    MetaBatchGetXAttr = 0x34,
    /// Start a multipart upload.
    MetaCreateMultipart = 0x38,
    /// Append a part to a multipart upload.
    MetaAppendMultipart = 0x39,
    /// Remove a multipart upload.
    MetaRemoveMultipart = 0x3A,
    /// List multipart uploads by prefix with pagination.
    MetaListMultiparts = 0x3B,
    /// Fetch one multipart upload record.
    MetaGetMultipart = 0x3C,
    /// Master task: meta node heartbeat.
    MetaNodeHeartbeat = 0x3F,
}

impl Opcode {
    /// Decodes an opcode from its wire byte.
    pub fn from_u8(b: u8) -> Result<Self, ProtoError> {
        use Opcode::*;
        Ok(match b {
            0x01 => CreateFile,
            0x02 => MarkDelete,
            0x03 => Write,
            0x04 => Read,
            0x05 => StreamRead,
            0x06 => GetWatermark,
            0x07 => ExtentStoreGetAllWatermark,
            0x08 => NotifyExtentRepair,
            0x09 => CreateDataPartition,
            0x0A => LoadDataPartition,
            0x0B => DeleteDataPartition,
            0x0C => DataNodeHeartbeat,
            0x0D => GetDataPartitionMetrics,
            0x20 => MetaCreateInode,
            0x21 => MetaCreateDentry,
            0x22 => MetaUnlinkInode,
            0x23 => MetaEvictInode,
            0x24 => MetaLookup,
            0x25 => MetaInodeGet,
            0x26 => MetaBatchInodeGet,
            0x27 => MetaReadDir,
            0x28 => MetaExtentsAdd,
            0x29 => MetaExtentsList,
            0x2A => MetaTruncate,
            0x2B => MetaLinkInode,
            0x2C => MetaUpdateDentry,
            0x2D => MetaDeleteDentry,
            0x2E => MetaSetAttr,
            0x30 => MetaSetXAttr,
            0x31 => MetaGetXAttr,
            0x32 => MetaListXAttr,
            0x33 => MetaRemoveXAttr,
            0x34 => MetaBatchGetXAttr,
            0x38 => MetaCreateMultipart,
            0x39 => MetaAppendMultipart,
            0x3A => MetaRemoveMultipart,
            0x3B => MetaListMultiparts,
            0x3C => MetaGetMultipart,
            0x3F => MetaNodeHeartbeat,
            other => return Err(ProtoError::UnknownOpcode(other)),
        })
    }

    /// Returns true for operations the leader threads through the replica
    /// chain (create, write, mark-delete).
    pub fn is_forwarded(self) -> bool {
        matches!(self, Opcode::CreateFile | Opcode::Write | Opcode::MarkDelete)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Reply status carried in the packet's result-code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// Success.
    Ok = 0,
    /// Generic failure; body carries the action tag and message.
    Err = 1,
    /// Target already exists.
    ExistErr = 2,
    /// Target does not exist.
    NotExistErr = 3,
    /// Partition or disk out of room / read-only.
    NoSpaceErr = 4,
    /// Bad offset, size, alignment, or envelope opcode.
    ArgMismatchErr = 5,
    /// Mutation received by a non-leader replica.
    NotLeaderErr = 6,
    /// Transient failure; caller should retry.
    Again = 7,
    /// Inode cursor reached the partition's end.
    InodeOutOfRange = 8,
    /// A follower's reply disagreed with the leader's packet identity.
    ReplicaMismatch = 9,
}

impl ResultCode {
    /// Decodes a result code from its wire byte; unknown bytes collapse to
    /// the generic error so old peers stay readable.
    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => ResultCode::Ok,
            2 => ResultCode::ExistErr,
            3 => ResultCode::NotExistErr,
            4 => ResultCode::NoSpaceErr,
            5 => ResultCode::ArgMismatchErr,
            6 => ResultCode::NotLeaderErr,
            7 => ResultCode::Again,
            8 => ResultCode::InodeOutOfRange,
            9 => ResultCode::ReplicaMismatch,
            _ => ResultCode::Err,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for op in [
            Opcode::CreateFile,
            Opcode::Write,
            Opcode::StreamRead,
            Opcode::MarkDelete,
            Opcode::ExtentStoreGetAllWatermark,
            Opcode::MetaCreateInode,
            Opcode::MetaUpdateDentry,
            Opcode::MetaListMultiparts,
            Opcode::MetaNodeHeartbeat,
        ] {
            assert_eq!(Opcode::from_u8(op as u8).unwrap(), op);
        }
    }

    #[test]
    fn test_opcode_unknown() {
        assert!(Opcode::from_u8(0xEE).is_err());
    }

    #[test]
    fn test_forwarded_ops() {
        assert!(Opcode::CreateFile.is_forwarded());
        assert!(Opcode::Write.is_forwarded());
        assert!(Opcode::MarkDelete.is_forwarded());
        assert!(!Opcode::Read.is_forwarded());
        assert!(!Opcode::StreamRead.is_forwarded());
    }

    #[test]
    fn test_store_mode() {
        assert_eq!(StoreMode::from_u8(1).unwrap(), StoreMode::Normal);
        assert_eq!(StoreMode::from_u8(2).unwrap(), StoreMode::Tiny);
        assert!(StoreMode::from_u8(3).is_err());
    }

    #[test]
    fn test_result_code_unknown_collapses_to_err() {
        assert_eq!(ResultCode::from_u8(0), ResultCode::Ok);
        assert_eq!(ResultCode::from_u8(200), ResultCode::Err);
    }
}
