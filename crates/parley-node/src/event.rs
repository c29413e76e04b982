//! Events the node reports to its display collaborator.

use std::fmt;

use parley_core::{DeliveredMessage, PeerAddress, PeerId, SessionName};
use serde::{Deserialize, Serialize};

use crate::directory::PresenceChange;
use crate::session::{SessionKind, SessionState};

/// Something the user should see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    /// A session was created, locally or by a peer.
    SessionOpened {
        session: SessionName,
        initiator: PeerId,
    },
    /// Every link of a session is up.
    SessionActive { session: SessionName },
    /// A message was sent or received completely.
    Message(DeliveredMessage),
    /// One peer of a group left; the group goes on.
    PeerLeft {
        session: SessionName,
        peer: PeerId,
        reason: String,
    },
    /// The session is gone.
    SessionEnded {
        session: SessionName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<PeerId>,
        reason: String,
    },
    /// A link to one peer closed or failed.
    LinkLost {
        session: SessionName,
        peer: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Could not reach a peer.
    DialFailed {
        session: SessionName,
        peer: PeerId,
        error: String,
    },
    /// A peer wants to start a call; answer with accept or reject.
    CallRequested { session: SessionName, peer: PeerId },
    CallStarted { session: SessionName, peer: PeerId },
    /// The peer declined, or was already in a call.
    CallRejected { session: SessionName, peer: PeerId },
    CallEnded {
        session: SessionName,
        peer: PeerId,
        reason: String,
    },
    /// A known peer came online, moved, or went offline.
    PresenceChanged {
        peer: PeerId,
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<PeerAddress>,
    },
}

impl From<PresenceChange> for NodeEvent {
    fn from(change: PresenceChange) -> Self {
        Self::PresenceChanged {
            peer: change.peer,
            online: change.address.is_some(),
            address: change.address,
        }
    }
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionOpened { session, initiator } => {
                write!(f, "[{session}] opened by {initiator}")
            }
            Self::SessionActive { session } => write!(f, "[{session}] ready"),
            Self::Message(message) => write!(f, "[{}] {}", message.session(), message.summary()),
            Self::PeerLeft {
                session,
                peer,
                reason,
            } => write!(f, "[{session}] {peer} left ({reason})"),
            Self::SessionEnded {
                session,
                peer: Some(peer),
                reason,
            } => write!(f, "[{session}] ended by {peer} ({reason})"),
            Self::SessionEnded {
                session,
                peer: None,
                reason,
            } => write!(f, "[{session}] ended ({reason})"),
            Self::LinkLost {
                session,
                peer,
                error,
            } => match error {
                Some(error) => write!(f, "[{session}] lost {peer}: {error}"),
                None => write!(f, "[{session}] {peer} disconnected"),
            },
            Self::DialFailed {
                session,
                peer,
                error,
            } => write!(f, "[{session}] cannot reach {peer}: {error}"),
            Self::CallRequested { session, peer } => {
                write!(f, "[{session}] {peer} is calling (/accept or /reject)")
            }
            Self::CallStarted { session, peer } => write!(f, "[{session}] call with {peer} started"),
            Self::CallRejected { session, peer } => write!(f, "[{session}] {peer} rejected the call"),
            Self::CallEnded {
                session,
                peer,
                reason,
            } => write!(f, "[{session}] call with {peer} ended ({reason})"),
            Self::PresenceChanged {
                peer,
                address: Some(address),
                ..
            } => write!(f, "{peer} is online at {address}"),
            Self::PresenceChanged { peer, .. } => write!(f, "{peer} is offline"),
        }
    }
}

/// Snapshot of one session for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub name: SessionName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<PeerId>,
    pub state: &'static str,
    pub peers: Vec<PeerId>,
    pub linked: Vec<PeerId>,
    pub messages: usize,
}

impl SessionInfo {
    pub(crate) fn new(
        name: SessionName,
        kind: SessionKind,
        state: SessionState,
        peers: Vec<PeerId>,
        linked: Vec<PeerId>,
        messages: usize,
    ) -> Self {
        let leader = match kind {
            SessionKind::Private => None,
            SessionKind::Group { leader } => Some(leader),
        };
        let state = match state {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        Self {
            name,
            leader,
            state,
            peers,
            linked,
            messages,
        }
    }
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}/{} linked, {} messages",
            self.name,
            self.state,
            self.linked.len(),
            self.peers.len(),
            self.messages
        )?;
        if let Some(leader) = self.leader {
            write!(f, ", leader {leader}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::Direction;

    fn name() -> SessionName {
        "1111111111-2222222222".parse().unwrap()
    }

    fn peer() -> PeerId {
        "2222222222".parse().unwrap()
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = NodeEvent::CallRequested {
            session: name(),
            peer: peer(),
        };
        insta::assert_snapshot!(
            serde_json::to_string(&event).unwrap(),
            @r#"{"event":"call_requested","session":"1111111111-2222222222","peer":"2222222222"}"#
        );

        let ended = NodeEvent::SessionEnded {
            session: name(),
            peer: None,
            reason: "deleted".into(),
        };
        insta::assert_snapshot!(
            serde_json::to_string(&ended).unwrap(),
            @r#"{"event":"session_ended","session":"1111111111-2222222222","reason":"deleted"}"#
        );
    }

    #[test]
    fn presence_lines() {
        let online = NodeEvent::from(PresenceChange {
            peer: peer(),
            address: Some(PeerAddress::new("10.0.0.2", 2333)),
        });
        assert_eq!(online.to_string(), "2222222222 is online at 10.0.0.2:2333");
        insta::assert_snapshot!(
            serde_json::to_string(&online).unwrap(),
            @r#"{"event":"presence_changed","peer":"2222222222","online":true,"address":{"host":"10.0.0.2","port":2333}}"#
        );

        let offline = NodeEvent::from(PresenceChange {
            peer: peer(),
            address: None,
        });
        assert_eq!(offline.to_string(), "2222222222 is offline");
    }

    #[test]
    fn message_event_inlines_the_record() {
        let message = DeliveredMessage::text(name(), peer(), Direction::Received, "hello_world");
        let value = serde_json::to_value(NodeEvent::Message(message.clone())).unwrap();
        assert_eq!(value["event"], "message");
        assert_eq!(value["text"], "hello_world");

        let back: NodeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, NodeEvent::Message(message));
    }

    #[test]
    fn human_lines() {
        let event = NodeEvent::LinkLost {
            session: name(),
            peer: peer(),
            error: None,
        };
        assert_eq!(
            event.to_string(),
            "[1111111111-2222222222] 2222222222 disconnected"
        );

        let info = SessionInfo::new(
            "1111111111-2222222222-3333333333".parse().unwrap(),
            SessionKind::Group {
                leader: "1111111111".parse().unwrap(),
            },
            SessionState::Pending,
            vec![peer(), "3333333333".parse().unwrap()],
            vec![peer()],
            0,
        );
        assert_eq!(
            info.to_string(),
            "1111111111-2222222222-3333333333 pending 1/2 linked, 0 messages, leader 1111111111"
        );
    }
}
