//! Text envelope codec.
//!
//! The payload may itself contain the delimiter, so decoding anchors the head
//! fields from the left and the declared length from the right:
//!
//! 1. `session_name` is the text before the first delimiter
//! 2. `origin_port` is the text before the next delimiter (digits)
//! 3. `declared_length` is the text after the *last* delimiter (digits)
//! 4. `type` is the text before the next delimiter (0..=10)
//! 5. `sender_id` is the next ten characters (a valid peer id)
//! 6. `payload` is everything after that, minus one delimiter character
//!
//! Session names never contain the delimiter, peer ids are fixed width and
//! the numeric fields are digits only, so `decode(encode(e)) == e` for any
//! payload.

use std::fmt;
use std::str::FromStr;

use parley_core::{PEER_ID_LEN, PeerId, SessionName};

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::MessageType;

/// Field delimiter.
pub const DELIMITER: char = '_';

/// One decoded control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Session the message belongs to, as written by the sender.
    pub session_name: String,
    /// Port the sender listens on.
    pub origin_port: u16,
    pub message_type: MessageType,
    pub sender: PeerId,
    pub payload: String,
    /// Number of raw bytes following this envelope on the socket; 0 for text
    /// and control messages.
    pub declared_length: u64,
}

impl Envelope {
    pub fn new(
        session_name: impl Into<String>,
        origin_port: u16,
        message_type: MessageType,
        sender: PeerId,
        payload: impl Into<String>,
        declared_length: u64,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            origin_port,
            message_type,
            sender,
            payload: payload.into(),
            declared_length,
        }
    }

    /// A text message.
    pub fn text(
        session_name: impl Into<String>,
        origin_port: u16,
        sender: PeerId,
        text: impl Into<String>,
    ) -> Self {
        Self::new(session_name, origin_port, MessageType::Text, sender, text, 0)
    }

    /// A control message carrying no trailing bytes.
    pub fn control(
        session_name: impl Into<String>,
        origin_port: u16,
        message_type: MessageType,
        sender: PeerId,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(session_name, origin_port, message_type, sender, payload, 0)
    }

    /// Header announcing `size` raw bytes of an image or file named `name`.
    pub fn transfer(
        session_name: impl Into<String>,
        origin_port: u16,
        message_type: MessageType,
        sender: PeerId,
        name: impl Into<String>,
        size: u64,
    ) -> Self {
        Self::new(session_name, origin_port, message_type, sender, name, size)
    }

    /// The session name, if it is canonical.
    pub fn session(&self) -> Option<SessionName> {
        self.session_name.parse().ok()
    }

    /// Encodes the envelope as UTF-8 bytes (unframed).
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Decodes an envelope, reporting why decoding failed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedHeader`] for non UTF-8 input or any
    /// field that does not match the layout.
    pub fn try_decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::malformed(format!("not utf-8: {e}")))?;
        text.parse()
    }

    /// Decodes an envelope. Undecodable input yields `None`; callers drop
    /// the frame.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        Self::try_decode(bytes).ok()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = DELIMITER;
        write!(
            f,
            "{}{d}{}{d}{}{d}{}{d}{}{d}{}",
            self.session_name,
            self.origin_port,
            self.message_type,
            self.sender,
            self.payload,
            self.declared_length
        )
    }
}

impl FromStr for Envelope {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session_name, rest) = s
            .split_once(DELIMITER)
            .ok_or_else(|| ProtocolError::malformed("missing session name"))?;

        let (port, rest) = rest
            .split_once(DELIMITER)
            .ok_or_else(|| ProtocolError::malformed("missing origin port"))?;
        let origin_port = parse_digits::<u16>(port, "origin port")?;

        let (rest, length) = rest
            .rsplit_once(DELIMITER)
            .ok_or_else(|| ProtocolError::malformed("missing declared length"))?;
        let declared_length = parse_digits::<u64>(length, "declared length")?;

        let (ty, rest) = rest
            .split_once(DELIMITER)
            .ok_or_else(|| ProtocolError::malformed("missing message type"))?;
        let message_type = MessageType::try_from(parse_digits::<u8>(ty, "message type")?)?;

        let id_end = rest
            .char_indices()
            .nth(PEER_ID_LEN)
            .map_or(rest.len(), |(i, _)| i);
        let sender: PeerId = rest[..id_end]
            .parse()
            .map_err(|e: parley_core::IdError| ProtocolError::malformed(e.to_string()))?;

        let mut tail = rest[id_end..].chars();
        tail.next();

        Ok(Self {
            session_name: session_name.to_string(),
            origin_port,
            message_type,
            sender,
            payload: tail.as_str().to_string(),
            declared_length,
        })
    }
}

fn parse_digits<T: FromStr>(text: &str, field: &str) -> ProtocolResult<T> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::malformed(format!(
            "{field} is not numeric: {text:?}"
        )));
    }
    text.parse()
        .map_err(|_| ProtocolError::malformed(format!("{field} out of range: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str = "1111111111-2222222222";

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn encode_layout() {
        let envelope = Envelope::text(PRIVATE, 2333, id("1111111111"), "hello_world");
        insta::assert_snapshot!(envelope, @"1111111111-2222222222_2333_0_1111111111_hello_world_0");

        let header = Envelope::transfer(
            PRIVATE,
            9001,
            MessageType::Image,
            id("2222222222"),
            "/tmp/cat.png",
            2048,
        );
        insta::assert_snapshot!(header, @"1111111111-2222222222_9001_1_2222222222_/tmp/cat.png_2048");
    }

    #[test]
    fn hello_world_end_to_end() {
        let sent = Envelope::text(PRIVATE, 2333, id("1111111111"), "hello_world");
        let received = Envelope::decode(&sent.encode()).unwrap();

        assert_eq!(received.sender, id("1111111111"));
        assert_eq!(received.message_type, MessageType::Text);
        assert_eq!(received.payload, "hello_world");
        assert_eq!(received.session_name, PRIVATE);
        assert_eq!(received.declared_length, 0);
        assert_eq!(received.session().unwrap().as_str(), PRIVATE);
    }

    #[test]
    fn payload_delimiters_survive_roundtrip() {
        for payload in [
            "",
            "plain",
            "_",
            "a_b",
            "___",
            "_leading",
            "trailing_",
            "ends_with_digits_42",
            "x_1_2_3333333333_y_0",
            "中文_消息",
        ] {
            for ty in MessageType::ALL {
                let envelope = Envelope::new(
                    "1000000000-2000000000-3000000000",
                    65535,
                    ty,
                    id("3000000000"),
                    payload,
                    7,
                );
                let decoded = Envelope::decode(&envelope.encode());
                assert_eq!(decoded.as_ref(), Some(&envelope), "payload {payload:?}");
            }
        }
    }

    #[test]
    fn length_is_anchored_at_last_delimiter() {
        let decoded: Envelope = "1111111111-2222222222_2333_1_1111111111_my_file_9_10"
            .parse()
            .unwrap();
        assert_eq!(decoded.payload, "my_file_9");
        assert_eq!(decoded.declared_length, 10);
    }

    #[test]
    fn missing_payload_separator_is_tolerated() {
        let decoded: Envelope = "s_1_7_1111111111_0".parse().unwrap();
        assert_eq!(decoded.message_type, MessageType::PeerDeletedChat);
        assert_eq!(decoded.payload, "");
    }

    #[test]
    fn malformed_inputs_yield_no_envelope() {
        for bad in [
            "",
            "no delimiters at all",
            "s_abc_0_1111111111_x_0",
            "s__0_1111111111_x_0",
            "s_70000_0_1111111111_x_0",
            "s_1_0_1111111111_x_",
            "s_1_0_1111111111_x_-3",
            "s_1_11_1111111111_x_0",
            "s_1_a_1111111111_x_0",
            "s_1_0_11111_x_0",
            "s_1_0_abcdefghij_x_0",
            "s_1_0",
        ] {
            assert!(
                matches!(bad.parse::<Envelope>(), Err(ProtocolError::MalformedHeader(_))),
                "{bad:?} should not decode"
            );
            assert!(Envelope::decode(bad.as_bytes()).is_none());
        }
    }

    #[test]
    fn invalid_utf8_is_dropped() {
        assert!(Envelope::decode(&[0xff, 0xfe, b'_', b'1']).is_none());
    }
}
