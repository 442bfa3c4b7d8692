//! Error types for wire protocol encoding and decoding.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Error variants for packet framing and message codecs.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Wraps standard I/O errors from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame did not start with the protocol magic byte.
    #[error("bad packet magic: {0:#04x}")]
    BadMagic(u8),

    /// The opcode byte is not in the opcode table.
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// The store-mode byte is neither normal nor tiny.
    #[error("unknown store mode: {0:#04x}")]
    UnknownStoreMode(u8),

    /// Declared body or argument length exceeds the frame limit.
    #[error("frame too large: {field} is {len} bytes, limit {limit}")]
    FrameTooLarge {
        /// Which length field overflowed.
        field: &'static str,
        /// The declared length.
        len: u32,
        /// The enforced limit.
        limit: u32,
    },

    /// The downstream-address argument blob was not valid UTF-8.
    #[error("packet arg is not valid UTF-8")]
    BadArg,

    /// A JSON message body failed to encode or decode.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A fixed-width binary record was shorter than its declared layout.
    #[error("truncated record: need {need} bytes, have {have}")]
    TruncatedRecord {
        /// Bytes required by the record layout.
        need: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// The admin-task envelope carried an opcode that does not match the
    /// operation being handled.
    #[error("task opcode mismatch: expected {expected:#04x}, got {got:#04x}")]
    TaskOpcodeMismatch {
        /// Opcode the handler expected.
        expected: u8,
        /// Opcode carried by the envelope.
        got: u8,
    },
}
