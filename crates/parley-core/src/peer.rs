//! Peer identity and addressing.
//!
//! A [`PeerId`] is the stable, network-wide identity of a participant: exactly
//! ten ASCII decimal digits. A [`PeerAddress`] is where that participant is
//! currently listening, and may change between sessions. [`Peer`] bundles the
//! two as a small immutable value that is copied rather than shared.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of characters in a [`PeerId`].
pub const PEER_ID_LEN: usize = 10;

/// Errors produced when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Not exactly ten decimal digits.
    #[error("invalid peer id {0:?}: expected 10 decimal digits")]
    InvalidPeerId(String),

    /// Not a canonical `id-id[-id...]` session name.
    #[error("invalid session name {0:?}")]
    InvalidSessionName(String),
}

/// Fixed-length numeric peer identity.
///
/// Ordering is lexicographic over the digits, which for equal-length numeric
/// strings is the same as numeric ordering. Mesh formation relies on this
/// total order to decide who dials whom.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Returns true if `text` is a well-formed peer id.
    pub fn is_valid(text: &str) -> bool {
        text.len() == PEER_ID_LEN && text.bytes().all(|b| b.is_ascii_digit())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        // Only ASCII digits are ever stored.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for PeerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_valid(s) {
            return Err(IdError::InvalidPeerId(s.to_string()));
        }
        let mut digits = [0u8; PEER_ID_LEN];
        digits.copy_from_slice(s.as_bytes());
        Ok(Self(digits))
    }
}

impl TryFrom<String> for PeerId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.as_str().to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.as_str())
    }
}

/// Host and port a peer is listening on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns a copy of this address with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            // IPv6 literal
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// A known participant: identity plus last known address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub address: PeerAddress,
}

impl Peer {
    pub fn new(id: PeerId, address: PeerAddress) -> Self {
        Self { id, address }
    }
}
