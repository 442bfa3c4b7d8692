//! Error types for the extent storage engine.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for extent and store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The extent id is already present in the store.
    #[error("extent {0} already exists")]
    ExtentExists(u64),

    /// The extent id is unknown to the store.
    #[error("extent {0} not found")]
    ExtentNotFound(u64),

    /// The entry file is smaller than the extent header.
    #[error("broken extent file {extent_id}: {size} bytes is below the header size")]
    BrokenExtent {
        /// Extent id of the broken entry file.
        extent_id: u64,
        /// Observed file size.
        size: u64,
    },

    /// The offset/size pair violates the extent write or read bounds, or a
    /// tiny delete is misaligned.
    #[error("param mismatch: offset={offset} size={size}")]
    ParamMismatch {
        /// Requested offset.
        offset: u64,
        /// Requested size.
        size: u64,
    },

    /// The extent has been tombstoned; writes are rejected.
    #[error("extent {0} has been marked deleted")]
    HasBeenDeleted(u64),

    /// The partition or disk is out of room or read-only.
    #[error("no space left on data partition")]
    NoSpace,

    /// The tiny pool has no claimable extent right now.
    #[error("no available tiny extent")]
    NoAvailTinyExtent,

    /// A tiny write would push the extent past its addressable limit.
    #[error("extent {0} is full")]
    ExtentFull(u64),

    /// A tiny-only operation was applied to a normal extent.
    #[error("extent {0} is not a tiny extent")]
    NotTinyExtent(u64),
}
