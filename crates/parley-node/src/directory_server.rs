//! Development directory server.
//!
//! Keeps an in-memory map from peer id to the address a peer registered
//! from. The host recorded is the remote IP of the registering connection.
//! Useful for running several peers on one machine; a production directory
//! is an external service speaking the same grammar.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parley_core::{PeerAddress, PeerId};
use parley_protocol::directory::{
    DEFAULT_LISTEN_PORT, MAX_DIRECTORY_MESSAGE, is_valid_listen_port,
};
use parley_protocol::{DirectoryCommand, DirectoryReply};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::NodeResult;
use crate::signals::ShutdownHandle;
use crate::wire::{UNFRAMED_QUIET, read_unframed};

type Registry = Arc<RwLock<HashMap<PeerId, PeerAddress>>>;

/// In-memory presence service.
pub struct DirectoryServer {
    listener: TcpListener,
    credential: Arc<str>,
    registry: Registry,
}

impl DirectoryServer {
    /// Binds the server.
    pub async fn bind(addr: impl ToSocketAddrs, credential: &str) -> NodeResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(address = %listener.local_addr()?, "Directory server listening");
        Ok(Self {
            listener,
            credential: Arc::from(credential),
            registry: Arc::default(),
        })
    }

    pub fn local_addr(&self) -> NodeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts clients until `shutdown` is triggered.
    pub async fn run_until_shutdown(self, shutdown: ShutdownHandle) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "Directory client connected");
                        let registry = self.registry.clone();
                        let credential = self.credential.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = serve_client(stream, remote, registry, credential) => {}
                                _ = shutdown.cancelled() => {}
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept directory client"),
                },
                _ = shutdown.cancelled() => {
                    info!("Directory server stopping");
                    return;
                }
            }
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    remote: SocketAddr,
    registry: Registry,
    credential: Arc<str>,
) {
    loop {
        let message = match read_unframed(&mut stream, MAX_DIRECTORY_MESSAGE, UNFRAMED_QUIET).await {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                debug!(%remote, error = %e, "Directory client read failed");
                return;
            }
        };

        let text = String::from_utf8_lossy(&message);
        let reply = handle_command(&registry, remote.ip(), &credential, &text).await;
        if let Err(e) = stream.write_all(reply.to_string().as_bytes()).await {
            debug!(%remote, error = %e, "Directory client write failed");
            return;
        }
        if reply == DirectoryReply::LoggedOut {
            return;
        }
    }
}

async fn handle_command(
    registry: &Registry,
    remote_ip: IpAddr,
    credential: &str,
    text: &str,
) -> DirectoryReply {
    let command = match text.parse::<DirectoryCommand>() {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, "Invalid directory command");
            return DirectoryReply::InvalidCommand;
        }
    };

    match command {
        DirectoryCommand::Register {
            id,
            credential: given,
            port,
        } => {
            let port = port.unwrap_or(DEFAULT_LISTEN_PORT);
            if given != credential || !is_valid_listen_port(port) {
                warn!(peer = %id, port, "Rejected registration");
                return DirectoryReply::InvalidCommand;
            }
            let address = PeerAddress::new(remote_ip.to_string(), port);
            info!(peer = %id, %address, "Peer online");
            registry.write().await.insert(id, address);
            DirectoryReply::Ok
        }
        DirectoryCommand::Query(id) => match registry.read().await.get(&id) {
            Some(address) => DirectoryReply::Found {
                host: address.host.clone(),
                port: address.port,
            },
            None => DirectoryReply::NotFound,
        },
        DirectoryCommand::Logout(id) => {
            if registry.write().await.remove(&id).is_some() {
                info!(peer = %id, "Peer offline");
            }
            DirectoryReply::LoggedOut
        }
    }
}
