//! Client error types.

use std::fmt;

use parley_node::{DirectoryError, NodeError};

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug)]
pub enum ClientError {
    /// Configuration error.
    Config(String),
    /// IO error.
    Io(std::io::Error),
    /// The node refused or failed an operation.
    Node(NodeError),
    /// Directory round trip failed.
    Directory(String),
    /// A typed command could not be understood.
    Input(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Node(err) => write!(f, "{}", err),
            Self::Directory(msg) => write!(f, "directory error: {}", msg),
            Self::Input(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Node(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<NodeError> for ClientError {
    fn from(err: NodeError) -> Self {
        Self::Node(err)
    }
}

impl From<DirectoryError> for ClientError {
    fn from(err: DirectoryError) -> Self {
        Self::Directory(err.to_string())
    }
}
