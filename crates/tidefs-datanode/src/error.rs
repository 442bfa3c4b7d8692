//! Error types for the data tier.

use thiserror::Error;

use tidefs_proto::ResultCode;

/// Result type alias for data-node operations.
pub type DataNodeResult<T> = Result<T, DataNodeError>;

/// Error variants for partition, pipeline, and service operations.
#[derive(Debug, Error)]
pub enum DataNodeError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Extent storage failure.
    #[error(transparent)]
    Storage(#[from] tidefs_storage::StorageError),

    /// Wire protocol failure.
    #[error(transparent)]
    Proto(#[from] tidefs_proto::ProtoError),

    /// Connection pool failure.
    #[error(transparent)]
    Transport(#[from] tidefs_transport::TransportError),

    /// JSON envelope failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The partition id is not mounted on this node.
    #[error("data partition {0} not found")]
    PartitionNotFound(u32),

    /// The partition or its disk is out of room or read-only.
    #[error("no space on data partition")]
    NoSpace,

    /// The partition META file failed validation.
    #[error("illegal data partition meta: {0}")]
    IllegalMeta(String),

    /// A follower's reply disagreed with the forwarded packet's identity.
    #[error("replica {addr} reply mismatch for request {req_id}")]
    ReplicaMismatch {
        /// Follower address.
        addr: String,
        /// Request id the mismatch was observed on.
        req_id: u64,
    },

    /// A follower answered with an error result code.
    #[error("replica {addr} failed: {code}: {message}")]
    ReplicaFailed {
        /// Follower address.
        addr: String,
        /// Result code the follower returned.
        code: ResultCode,
        /// Error body the follower attached.
        message: String,
    },
}

impl DataNodeError {
    /// Maps this error onto the wire result code.
    pub fn result_code(&self) -> ResultCode {
        use tidefs_storage::StorageError;
        match self {
            DataNodeError::Storage(StorageError::ExtentExists(_)) => ResultCode::ExistErr,
            DataNodeError::Storage(StorageError::ExtentNotFound(_)) => ResultCode::NotExistErr,
            DataNodeError::Storage(StorageError::ParamMismatch { .. }) => {
                ResultCode::ArgMismatchErr
            }
            DataNodeError::Storage(StorageError::NoSpace) | DataNodeError::NoSpace => {
                ResultCode::NoSpaceErr
            }
            DataNodeError::Storage(StorageError::NoAvailTinyExtent) => ResultCode::Again,
            DataNodeError::PartitionNotFound(_) => ResultCode::NotExistErr,
            DataNodeError::ReplicaMismatch { .. } => ResultCode::ReplicaMismatch,
            _ => ResultCode::Err,
        }
    }
}
