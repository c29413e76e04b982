//! Message type catalogue.

use std::fmt;

use crate::error::ProtocolError;

/// Kind of an [`Envelope`](crate::Envelope). Closed set, encoded on the
/// wire as its decimal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Text = 0,
    Image = 1,
    File = 2,
    PrivateRequest = 3,
    GroupRequest = 4,
    PrivateResponse = 5,
    GroupResponse = 6,
    PeerDeletedChat = 7,
    PeerLoggedOut = 8,
    VideoRequest = 9,
    VideoResponse = 10,
}

impl MessageType {
    pub const ALL: [MessageType; 11] = [
        Self::Text,
        Self::Image,
        Self::File,
        Self::PrivateRequest,
        Self::GroupRequest,
        Self::PrivateResponse,
        Self::GroupResponse,
        Self::PeerDeletedChat,
        Self::PeerLoggedOut,
        Self::VideoRequest,
        Self::VideoResponse,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Content that ends up in a session's history.
    pub fn is_content(self) -> bool {
        matches!(self, Self::Text | Self::Image | Self::File)
    }

    /// Content followed by `declared_length` raw bytes.
    pub fn is_transfer(self) -> bool {
        matches!(self, Self::Image | Self::File)
    }

    /// Types that end a session.
    pub fn is_termination(self) -> bool {
        matches!(self, Self::PeerDeletedChat | Self::PeerLoggedOut)
    }

    /// Call signalling.
    pub fn is_call_signal(self) -> bool {
        matches!(self, Self::VideoRequest | Self::VideoResponse)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| ProtocolError::malformed(format!("unknown message type {value}")))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        for (i, ty) in MessageType::ALL.iter().enumerate() {
            assert_eq!(usize::from(ty.as_u8()), i);
            assert_eq!(MessageType::try_from(i as u8).unwrap(), *ty);
        }
        assert_eq!(MessageType::VideoResponse.to_string(), "10");
    }

    #[test]
    fn unknown_values_are_rejected() {
        assert!(matches!(
            MessageType::try_from(11),
            Err(ProtocolError::MalformedHeader(_))
        ));
        assert!(MessageType::try_from(255).is_err());
    }

    #[test]
    fn classification() {
        assert!(MessageType::Text.is_content());
        assert!(!MessageType::Text.is_transfer());
        assert!(MessageType::File.is_transfer());
        assert!(MessageType::PeerLoggedOut.is_termination());
        assert!(MessageType::VideoRequest.is_call_signal());
        assert!(!MessageType::VideoRequest.is_content());
    }
}
