//! Error types for the transport layer.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error variants for connection pooling and dialing.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dialing the target did not complete within the configured timeout.
    #[error("connect to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout {
        /// Target address.
        addr: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },
}
