//! Error types for the wire codec.

use thiserror::Error;

/// Errors produced while encoding or decoding protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload ended before the expected field.
    #[error("unexpected end of data at offset {offset}")]
    UnexpectedEof { offset: usize },

    /// The frame header carried an unknown network magic.
    #[error("invalid magic bytes 0x{got:08x} (expected 0x{expected:08x})")]
    InvalidMagic { got: u32, expected: u32 },

    /// The payload did not hash to the checksum in the frame header.
    #[error("checksum mismatch on `{command}` frame")]
    ChecksumMismatch { command: String },

    /// The frame header announced a payload above the safety limit.
    #[error("payload length {length} exceeds limit")]
    OversizedPayload { length: usize },

    /// Structurally invalid payload.
    #[error("malformed {context}")]
    Malformed { context: &'static str },

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for errors that condemn the whole connection rather than a
    /// single payload (framing-level failures).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMagic { .. }
                | ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::OversizedPayload { .. }
                | ProtocolError::Io(_)
        )
    }
}
