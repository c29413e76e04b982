//! Core types: peer identity, session names, delivered messages, tracing

pub mod message;
pub mod peer;
pub mod session_name;
pub mod tracing;

pub use message::{ContentKind, DeliveredMessage, Direction};
pub use peer::{IdError, PEER_ID_LEN, Peer, PeerAddress, PeerId};
pub use session_name::{SESSION_NAME_SEPARATOR, SessionName};
pub use tracing::{LogFormat, TracingConfig, TracingError, init_tracing};
