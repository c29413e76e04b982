//! Directory client and peer address book.
//!
//! [`DirectoryClient`] is a thin proxy over one TCP connection to the
//! presence service: every call is a single command/reply round trip. It
//! does not retry; a refused connection is reported to the caller.
//!
//! [`PeerBook`] is what the rest of the node asks for addresses. It caches
//! every peer it has heard from and falls back to a directory query. With a
//! directory it also tracks which known peers are online.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use parley_core::{Peer, PeerAddress, PeerId};
use parley_protocol::directory::MAX_DIRECTORY_MESSAGE;
use parley_protocol::{DirectoryCommand, DirectoryReply};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DirectoryError, NodeError, NodeResult};
use crate::wire::{UNFRAMED_QUIET, read_unframed};

/// Connection to the directory service.
#[derive(Debug)]
pub struct DirectoryClient {
    stream: TcpStream,
    address: PeerAddress,
}

impl DirectoryClient {
    /// Connects once. A refused connection is returned as an error.
    pub async fn connect(address: &PeerAddress) -> Result<Self, DirectoryError> {
        let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        debug!(%address, "Connected to directory");
        Ok(Self {
            stream,
            address: address.clone(),
        })
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Announces `id` as online, listening on `listen_port`.
    ///
    /// Without a port the directory records the default listen port.
    pub async fn register(
        &mut self,
        id: PeerId,
        credential: &str,
        listen_port: Option<u16>,
    ) -> Result<(), DirectoryError> {
        let command = DirectoryCommand::Register {
            id,
            credential: credential.to_string(),
            port: listen_port,
        };
        match self.round_trip(&command).await? {
            DirectoryReply::Ok => {
                info!(peer = %id, port = ?listen_port, "Registered with directory");
                Ok(())
            }
            DirectoryReply::InvalidCommand => Err(DirectoryError::Rejected {
                command: command.to_string(),
            }),
            other => Err(DirectoryError::UnexpectedReply(other.to_string())),
        }
    }

    /// Looks up where `id` is listening.
    pub async fn query(&mut self, id: PeerId) -> Result<Option<PeerAddress>, DirectoryError> {
        match self.round_trip(&DirectoryCommand::Query(id)).await? {
            DirectoryReply::Found { host, port } => Ok(Some(PeerAddress::new(host, port))),
            DirectoryReply::NotFound => Ok(None),
            DirectoryReply::InvalidCommand => Err(DirectoryError::Rejected {
                command: DirectoryCommand::Query(id).to_string(),
            }),
            other => Err(DirectoryError::UnexpectedReply(other.to_string())),
        }
    }

    /// Announces `id` as offline.
    pub async fn deregister(&mut self, id: PeerId) -> Result<(), DirectoryError> {
        match self.round_trip(&DirectoryCommand::Logout(id)).await? {
            DirectoryReply::LoggedOut => {
                info!(peer = %id, "Deregistered from directory");
                Ok(())
            }
            other => Err(DirectoryError::UnexpectedReply(other.to_string())),
        }
    }

    async fn round_trip(
        &mut self,
        command: &DirectoryCommand,
    ) -> Result<DirectoryReply, DirectoryError> {
        self.stream.write_all(command.to_string().as_bytes()).await?;

        let reply = read_unframed(&mut self.stream, MAX_DIRECTORY_MESSAGE, UNFRAMED_QUIET)
            .await?
            .ok_or(DirectoryError::Closed)?;
        let text = String::from_utf8_lossy(&reply);
        debug!(command = %command, reply = %text, "Directory round trip");
        Ok(text.parse()?)
    }
}

/// Resolves peer ids to addresses.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    /// Returns where `id` listens, or `None` if nobody knows.
    async fn resolve(&self, id: PeerId) -> NodeResult<Option<Peer>>;
}

/// A known peer went online or offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub peer: PeerId,
    /// Where the peer listens now; `None` once it is offline.
    pub address: Option<PeerAddress>,
}

/// Address book: learned peers plus an optional directory connection.
#[derive(Debug, Default)]
pub struct PeerBook {
    known: RwLock<HashMap<PeerId, Peer>>,
    offline: RwLock<HashSet<PeerId>>,
    directory: Mutex<Option<DirectoryClient>>,
}

impl PeerBook {
    /// An empty book with no directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A book backed by a directory connection.
    pub fn with_directory(client: DirectoryClient) -> Self {
        Self {
            directory: Mutex::new(Some(client)),
            ..Self::default()
        }
    }

    /// Records where a peer was last seen. A peer we hear from is online.
    pub fn learn(&self, peer: Peer) {
        if let Ok(mut offline) = self.offline.write() {
            offline.remove(&peer.id);
        }
        if let Ok(mut known) = self.known.write() {
            match known.get(&peer.id) {
                Some(existing) if existing.address == peer.address => {}
                _ => {
                    debug!(peer = %peer.id, address = %peer.address, "Learned peer address");
                    known.insert(peer.id, peer);
                }
            }
        }
    }

    /// Returns the cached entry for `id`.
    pub fn lookup(&self, id: PeerId) -> Option<Peer> {
        self.known.read().ok()?.get(&id).cloned()
    }

    /// Whether a known peer is currently considered online.
    pub fn is_online(&self, id: PeerId) -> Option<bool> {
        self.lookup(id)?;
        let offline = self.offline.read().ok()?;
        Some(!offline.contains(&id))
    }

    /// Marks a known peer offline, e.g. after it logged out. Returns true if
    /// that changed anything.
    pub fn mark_offline(&self, id: PeerId) -> bool {
        if self.lookup(id).is_none() {
            return false;
        }
        self.offline
            .write()
            .map(|mut offline| offline.insert(id))
            .unwrap_or(false)
    }

    /// Looks every known peer up in the directory and returns the ones whose
    /// status changed. Addresses of online peers are refreshed.
    pub async fn refresh_presence(&self) -> Result<Vec<PresenceChange>, DirectoryError> {
        let mut ids: Vec<PeerId> = match self.known.read() {
            Ok(known) => known.keys().copied().collect(),
            Err(_) => return Ok(Vec::new()),
        };
        ids.sort();

        let mut changes = Vec::new();
        for id in ids {
            let was_online = self.is_online(id).unwrap_or(false);
            match self.query(id).await? {
                Some(address) => {
                    let moved = self.lookup(id).is_none_or(|peer| peer.address != address);
                    self.learn(Peer::new(id, address.clone()));
                    if !was_online || moved {
                        changes.push(PresenceChange {
                            peer: id,
                            address: Some(address),
                        });
                    }
                }
                None => {
                    if self.mark_offline(id) {
                        changes.push(PresenceChange {
                            peer: id,
                            address: None,
                        });
                    }
                }
            }
        }
        if !changes.is_empty() {
            debug!(changes = changes.len(), "Presence changed");
        }
        Ok(changes)
    }

    /// Returns true if a directory connection is configured.
    pub async fn has_directory(&self) -> bool {
        self.directory.lock().await.is_some()
    }

    /// Registers with the directory.
    pub async fn register(
        &self,
        id: PeerId,
        credential: &str,
        listen_port: u16,
    ) -> Result<(), DirectoryError> {
        let mut directory = self.directory.lock().await;
        let client = directory.as_mut().ok_or(DirectoryError::NotConfigured)?;
        client.register(id, credential, Some(listen_port)).await
    }

    /// Deregisters from the directory, if one is configured.
    pub async fn deregister(&self, id: PeerId) -> Result<(), DirectoryError> {
        let mut directory = self.directory.lock().await;
        match directory.as_mut() {
            Some(client) => client.deregister(id).await,
            None => Ok(()),
        }
    }

    /// Queries the directory, bypassing the cache.
    pub async fn query(&self, id: PeerId) -> Result<Option<PeerAddress>, DirectoryError> {
        let mut directory = self.directory.lock().await;
        let client = directory.as_mut().ok_or(DirectoryError::NotConfigured)?;
        client.query(id).await
    }
}

#[async_trait]
impl PeerResolver for PeerBook {
    async fn resolve(&self, id: PeerId) -> NodeResult<Option<Peer>> {
        if let Some(peer) = self.lookup(id) {
            return Ok(Some(peer));
        }
        if !self.has_directory().await {
            return Ok(None);
        }
        match self.query(id).await {
            Ok(Some(address)) => {
                let peer = Peer::new(id, address);
                self.learn(peer.clone());
                Ok(Some(peer))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(peer = %id, error = %e, "Directory query failed");
                Err(NodeError::Directory(e))
            }
        }
    }
}
