//! Wire format errors.

use thiserror::Error;

/// Errors raised while decoding frames or payloads.
#[derive(Debug, Error)]
pub enum WireError {
    /// The frame is shorter than the fixed header.
    #[error("frame truncated: {len} bytes, header needs {needed}")]
    Truncated { len: usize, needed: usize },

    /// The reply flag byte was neither 0 nor 1.
    #[error("invalid reply flag: {0}")]
    InvalidReplyFlag(u8),

    /// Payload serialization failed.
    #[error("payload encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Payload deserialization failed.
    #[error("payload decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}
