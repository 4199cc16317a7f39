//! Error types for frame decoding

use thiserror::Error;

/// Errors that can occur when decoding console frames.
///
/// A decoder returns one of these instead of a partially filled structure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Frame is too short to contain required data
    #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// A fixed marker field doesn't hold the expected text
    #[error("Invalid {field} marker: expected {expected:?}, got {actual:?}")]
    InvalidMarker {
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// Length field (or fixed frame size) doesn't match actual frame length
    #[error("Length mismatch: header says {header_len} bytes, frame has {actual_len}")]
    LengthMismatch { header_len: usize, actual_len: usize },

    /// Argument field names a command this codec doesn't know
    #[error("Unknown command argument: {0:?}")]
    UnknownCommand(String),

    /// Failed to deserialize frame structure
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Invalid UTF-8 or non-printable text in string field
    #[error("Invalid string encoding in {0}")]
    InvalidString(&'static str),

    /// Invalid frame data
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl From<bincode::Error> for DecodeError {
    fn from(e: bincode::Error) -> Self {
        DecodeError::DeserializationFailed(e.to_string())
    }
}
