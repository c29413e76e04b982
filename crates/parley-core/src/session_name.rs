//! Deterministic session names.
//!
//! A session is named by the sorted set of its participants joined with
//! [`SESSION_NAME_SEPARATOR`], so every participant derives the same name no
//! matter who created the session or in which order the ids were supplied.
//!
//! ```text
//! private: 1111111111-2222222222               (21 chars)
//! group:   1111111111-2222222222-3333333333    (32+ chars)
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::peer::{IdError, PEER_ID_LEN, PeerId};

/// Separator between ids in a session name.
pub const SESSION_NAME_SEPARATOR: char = '-';

/// Length of a private (two participant) session name.
const PRIVATE_NAME_LEN: usize = 2 * PEER_ID_LEN + 1;

/// Canonical name of a chat session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionName(String);

impl SessionName {
    /// Builds the name for a set of participants. Duplicates are ignored.
    ///
    /// Returns an error if fewer than two distinct participants are given.
    pub fn from_ids<I>(ids: I) -> Result<Self, IdError>
    where
        I: IntoIterator<Item = PeerId>,
    {
        let sorted: BTreeSet<PeerId> = ids.into_iter().collect();
        if sorted.len() < 2 {
            let joined: Vec<&str> = sorted.iter().map(PeerId::as_str).collect();
            return Err(IdError::InvalidSessionName(joined.join("-")));
        }
        let parts: Vec<&str> = sorted.iter().map(PeerId::as_str).collect();
        let separator = SESSION_NAME_SEPARATOR.to_string();
        Ok(Self(parts.join(separator.as_str())))
    }

    /// Name of the private session between two peers.
    pub fn private(a: PeerId, b: PeerId) -> Result<Self, IdError> {
        Self::from_ids([a, b])
    }

    /// Returns the participants in ascending id order.
    pub fn participants(&self) -> Vec<PeerId> {
        self.0
            .split(SESSION_NAME_SEPARATOR)
            .filter_map(|part| part.parse().ok())
            .collect()
    }

    /// Returns true if `id` takes part in this session.
    pub fn contains(&self, id: PeerId) -> bool {
        self.participants().contains(&id)
    }

    /// Returns the participants other than `me`.
    pub fn others(&self, me: PeerId) -> Vec<PeerId> {
        self.participants()
            .into_iter()
            .filter(|id| *id != me)
            .collect()
    }

    /// True for two-participant sessions.
    pub fn is_private(&self) -> bool {
        self.0.len() == PRIVATE_NAME_LEN
    }

    /// True for sessions with three or more participants.
    pub fn is_group(&self) -> bool {
        self.0.len() > PRIVATE_NAME_LEN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionName {
    type Err = IdError;

    /// Parses a name received from the wire. Only canonical names (strictly
    /// ascending, valid ids, at least two) are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdError::InvalidSessionName(s.to_string());
        let mut previous: Option<PeerId> = None;
        let mut count = 0usize;
        for part in s.split(SESSION_NAME_SEPARATOR) {
            let id: PeerId = part.parse().map_err(|_| invalid())?;
            if previous.is_some_and(|p| p >= id) {
                return Err(invalid());
            }
            previous = Some(id);
            count += 1;
        }
        if count < 2 {
            return Err(invalid());
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for SessionName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionName> for String {
    fn from(name: SessionName) -> Self {
        name.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
