//! Peer daemon: sessions, mesh formation, transfers, media calls.
//!
//! This crate provides everything a parley peer runs:
//! - A TCP listener that accepts peers and routes their handshakes
//! - A session manager owning private and group chat sessions
//! - Chunked file and image transfer
//! - Media calls with a rate-adaptive video loop
//! - A directory client, plus a small directory server for development
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use parley_node::{MediaBackend, Node, NodeConfig, PeerBook};
//!
//! async fn run(media: Arc<dyn MediaBackend>) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new("1111111111".parse()?);
//!     let (node, mut events) = Node::start(config, Arc::new(PeerBook::new()), media).await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{event}");
//!     }
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

mod config;
mod directory;
mod directory_server;
mod error;
mod event;
mod listener;
mod manager;
mod media;
mod mesh;
mod node;
mod session;
mod signals;
mod transfer;
mod wire;

pub use config::{DEFAULT_CHUNK_SIZE, DEFAULT_DIRECTORY_PORT, MediaConfig, NodeConfig};
pub use directory::{DirectoryClient, PeerBook, PeerResolver, PresenceChange};
pub use directory_server::DirectoryServer;
pub use error::{DirectoryError, NodeError, NodeResult};
pub use event::{NodeEvent, SessionInfo};
pub use listener::PeerListener;
pub use manager::{ManagerCommand, SessionManager, SessionManagerHandle};
pub use media::{
    MediaBackend, MediaListeners, MediaPeer, MediaSink, MediaSource, MediaStreamSession,
    RateController,
};
pub use mesh::outbound_targets;
pub use node::Node;
pub use session::{ChatSession, SessionContext, SessionEvent, SessionKind, SessionState};
pub use signals::{ShutdownHandle, SignalHandler};
pub use transfer::{receive_chunked, sanitize_filename, send_chunked};
pub use wire::{connect_with_retry, read_envelope, read_frame, write_envelope, write_frame};
