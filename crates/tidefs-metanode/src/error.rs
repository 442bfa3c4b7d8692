//! Error types for the metadata tier.

use thiserror::Error;

use tidefs_proto::ResultCode;

/// Result type alias for metadata operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Error variants for meta partitions, trees, and workers.
#[derive(Debug, Error)]
pub enum MetaError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON body failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A binary tree record failed to encode or decode.
    #[error("record codec error: {0}")]
    Record(#[from] bincode::Error),

    /// Wire protocol failure.
    #[error(transparent)]
    Proto(#[from] tidefs_proto::ProtoError),

    /// Connection pool failure.
    #[error(transparent)]
    Transport(#[from] tidefs_transport::TransportError),

    /// The inode does not exist (or is tombstoned).
    #[error("inode {0} not found")]
    InodeNotFound(u64),

    /// The dentry does not exist.
    #[error("entry '{name}' not found in directory {parent}")]
    DentryNotFound {
        /// Parent directory inode.
        parent: u64,
        /// Entry name.
        name: String,
    },

    /// The multipart upload does not exist.
    #[error("multipart ({path}, {id}) not found")]
    MultipartNotFound {
        /// Object path the upload targets.
        path: String,
        /// Upload id.
        id: String,
    },

    /// The record already exists.
    #[error("already exists")]
    Exists,

    /// The request's shape or target type is wrong (e.g. linking a
    /// directory, truncating with a stale generation).
    #[error("argument mismatch: {0}")]
    ArgMismatch(String),

    /// A mutation reached a non-leader replica.
    #[error("not leader")]
    NotLeader {
        /// Current leader address, when known.
        leader: Option<String>,
    },

    /// The inode cursor reached the partition's end; the caller should
    /// route new creates to the successor partition.
    #[error("inode id out of range: cursor {cursor} end {end}")]
    InodeIdOutOfRange {
        /// Cursor at failure time.
        cursor: u64,
        /// Partition ceiling.
        end: u64,
    },

    /// A persisted snapshot failed its CRC check or is malformed.
    #[error("broken snapshot: {0}")]
    Broken(String),

    /// Transient failure; the caller should retry.
    #[error("try again: {0}")]
    Again(String),

    /// The partition configuration failed validation.
    #[error("invalid partition config: {0}")]
    ConfigInvalid(String),

    /// No replicated log is attached to the partition yet.
    #[error("replicated log not attached")]
    LogNotAttached,
}

impl MetaError {
    /// Maps this error onto the wire result code.
    pub fn result_code(&self) -> ResultCode {
        match self {
            MetaError::InodeNotFound(_)
            | MetaError::DentryNotFound { .. }
            | MetaError::MultipartNotFound { .. } => ResultCode::NotExistErr,
            MetaError::Exists => ResultCode::ExistErr,
            MetaError::ArgMismatch(_) => ResultCode::ArgMismatchErr,
            MetaError::NotLeader { .. } => ResultCode::NotLeaderErr,
            MetaError::InodeIdOutOfRange { .. } => ResultCode::InodeOutOfRange,
            MetaError::Again(_) => ResultCode::Again,
            _ => ResultCode::Err,
        }
    }
}
