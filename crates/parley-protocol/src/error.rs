//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Envelope text does not follow the six-field layout.
    #[error("malformed envelope header: {0}")]
    MalformedHeader(String),

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: u32 },

    /// Incomplete frame or sample (input ended early).
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// Media sample written with an unknown format version.
    #[error("unsupported media format version: {0}")]
    UnsupportedVersion(u8),

    /// Media sample kind byte is not audio or video.
    #[error("unknown media kind: {0}")]
    UnknownMediaKind(u8),

    /// Text sent to the directory that is not a known command.
    #[error("invalid directory command: {0:?}")]
    InvalidCommand(String),

    /// Text received from the directory that is not a known reply.
    #[error("invalid directory reply: {0:?}")]
    InvalidReply(String),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedHeader(reason.into())
    }
}
