//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame payload exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },

    /// The stream ended in the middle of a frame.
    #[error("short read: stream ended mid-frame")]
    ShortRead,

    /// Unrecognized frame type byte.
    ///
    /// Servers close the connection on this; clients should skip the frame
    /// body and continue, so that new server-to-client frame types can be
    /// introduced without breaking old clients.
    #[error("unknown frame type: {0:#04x}")]
    UnknownType(u8),

    /// The frame type was recognized but its payload is invalid.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::Malformed`] with a formatted message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
