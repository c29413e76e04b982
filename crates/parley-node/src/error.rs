//! Node error types.

use std::io;

use parley_core::{IdError, PeerId, SessionName};
use parley_protocol::ProtocolError;
use thiserror::Error;

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors that can occur in the node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// IO error (socket, file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, etc.).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Malformed peer id or session name.
    #[error(transparent)]
    Id(#[from] IdError),

    /// Directory round trip failed.
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The directory does not know this peer.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// No live session with this name.
    #[error("no such session: {0}")]
    SessionNotFound(SessionName),

    /// The session was closed while the operation was pending.
    #[error("session {0} is closed")]
    SessionClosed(SessionName),

    /// The session did not become active in time.
    #[error("session {0} is still waiting for peers")]
    NotActive(SessionName),

    /// The session has no usable connection left.
    #[error("session {0} has no connected peers")]
    NoLinks(SessionName),

    /// A raw transfer ended before the declared length.
    #[error("transfer incomplete: expected {expected} bytes, got {received}")]
    TransferIncomplete { expected: u64, received: u64 },

    /// Call control not valid in the current call state.
    #[error("call error: {message}")]
    Call { message: String },

    /// Operation timed out.
    #[error("timeout during {operation}")]
    Timeout { operation: String },

    /// Shutdown requested.
    #[error("shutdown requested")]
    Cancelled,

    /// The session manager task is gone.
    #[error("session manager stopped")]
    ManagerStopped,
}

impl NodeError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a call state error.
    pub fn call(message: impl Into<String>) -> Self {
        Self::Call {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// True for errors that mean the remote end went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }
}

/// Errors from directory round trips.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Could not reach or talk to the directory.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Reply text did not parse.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The directory closed the connection.
    #[error("directory closed the connection")]
    Closed,

    /// The directory answered `invalid_command` (wrong credential, bad port).
    #[error("directory rejected {command:?}")]
    Rejected { command: String },

    /// The reply does not answer the command that was sent.
    #[error("unexpected directory reply {0:?}")]
    UnexpectedReply(String),

    /// No directory configured.
    #[error("no directory configured")]
    NotConfigured,
}
