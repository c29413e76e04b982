//! Wire protocol for parley peers.
//!
//! Every control-channel exchange between two peers is an [`Envelope`]: a
//! single text line of six `_`-delimited fields, UTF-8 encoded and framed with
//! a 4-byte big-endian length prefix.
//!
//! ```text
//! <session_name>_<origin_port>_<type>_<sender_id>_<payload>_<declared_length>
//! ```
//!
//! Images and files follow their envelope as raw bytes on the same socket (see
//! the transfer engine in `parley-node`). Media calls use the same framing on
//! separate sockets, carrying [`MediaSample`]s. The directory service speaks
//! the small text grammar in [`directory`].
//!
//! This crate performs no I/O.
//!
//! # Example
//!
//! ```rust
//! use parley_protocol::{Envelope, MessageType, decode_frame, encode_frame};
//!
//! let sender = "1111111111".parse().unwrap();
//! let envelope = Envelope::text("1111111111-2222222222", 2333, sender, "hello_world");
//! let frame = encode_frame(&envelope.encode()).unwrap();
//! let decoded = Envelope::decode(decode_frame(&frame).unwrap()).unwrap();
//! assert_eq!(decoded.message_type, MessageType::Text);
//! assert_eq!(decoded.payload, "hello_world");
//! ```

mod call;
pub mod directory;
mod envelope;
mod error;
mod framing;
mod media;
mod types;

pub use call::{CallAnswer, CallOffer, MediaPorts};
pub use directory::{DirectoryCommand, DirectoryReply};
pub use envelope::{DELIMITER, Envelope};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FRAME_HEADER_LEN, decode_frame, encode_frame, frame_length};
pub use media::{MEDIA_FORMAT_VERSION, MEDIA_HEADER_LEN, MediaKind, MediaSample};
pub use types::MessageType;

/// Maximum frame payload size (16 MB).
///
/// Control frames are tiny; the bound exists for media frames, which carry a
/// whole encoded video frame.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
