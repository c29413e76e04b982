//! Peer listener.
//!
//! Accepts connections from other peers, reads the handshake envelope and
//! hands the connection to the session manager. The number of handshakes in
//! flight is bounded by `max_connections`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::manager::SessionManagerHandle;
use crate::signals::ShutdownHandle;
use crate::wire::read_envelope;

/// TCP listener for peer connections.
pub struct PeerListener {
    config: Arc<NodeConfig>,
    listener: TcpListener,
    handshakes: Arc<Semaphore>,
}

impl PeerListener {
    /// Binds `bind_host:listen_port`. Port 0 picks a free port.
    pub async fn bind(config: Arc<NodeConfig>) -> NodeResult<Self> {
        let listener = TcpListener::bind((config.bind_host.as_str(), config.listen_port)).await?;
        info!(
            address = %listener.local_addr()?,
            peer = %config.peer_id,
            "Peer listener ready"
        );
        let handshakes = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Ok(Self {
            config,
            listener,
            handshakes,
        })
    }

    pub fn local_addr(&self) -> NodeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts peers until `shutdown` is triggered.
    pub async fn run_until_shutdown(self, manager: SessionManagerHandle, shutdown: ShutdownHandle) {
        loop {
            let permit = tokio::select! {
                permit = self.handshakes.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = shutdown.cancelled() => break,
            };
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "Peer connected");
                        let manager = manager.clone();
                        let timeout = self.config.connection_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = handshake(stream, remote, timeout, manager, permit).await {
                                warn!(%remote, error = %e, "Handshake failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept peer"),
                },
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Peer listener stopping");
    }
}

async fn handshake(
    mut stream: TcpStream,
    remote: SocketAddr,
    timeout: std::time::Duration,
    manager: SessionManagerHandle,
    _permit: OwnedSemaphorePermit,
) -> NodeResult<()> {
    let first = tokio::time::timeout(timeout, read_envelope(&mut stream))
        .await
        .map_err(|_| NodeError::timeout("handshake"))??;
    match first {
        Some(Some(envelope)) => {
            debug!(
                %remote,
                session = %envelope.session_name,
                sender = %envelope.sender,
                kind = %envelope.message_type,
                "Handshake received"
            );
            manager.route_inbound(stream, remote, envelope).await
        }
        Some(None) => {
            debug!(%remote, "Dropping peer with an undecodable handshake");
            Ok(())
        }
        None => {
            debug!(%remote, "Peer closed before the handshake");
            Ok(())
        }
    }
}
