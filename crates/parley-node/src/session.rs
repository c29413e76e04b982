//! Chat sessions.
//!
//! A [`ChatSession`] owns one link (private) or one link per other
//! participant (group). Each link is a TCP connection split in two: the read
//! half is served by its own task, the write half sits in a map behind a
//! single async mutex. Holding that mutex is what serialises sends, so an
//! envelope and the raw chunks that follow it are never interleaved with
//! another send on the same connection.
//!
//! ```text
//! Pending --(every expected link attached)--> Active --(close)--> Closed
//!    \______________________(close)__________________________/
//! ```
//!
//! Reader tasks do not touch their socket until the session is active.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use parley_core::{ContentKind, DeliveredMessage, Direction, PeerId, SessionName};
use parley_protocol::{Envelope, MessageType};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::directory::PeerResolver;
use crate::error::{NodeError, NodeResult};
use crate::signals::ShutdownHandle;
use crate::transfer::{self, receive_chunked, send_chunked};
use crate::wire::{connect_with_retry, read_envelope, write_envelope};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for expected links.
    Pending,
    /// Every expected link is attached; traffic flows.
    Active,
    /// Terminal.
    Closed,
}

/// Private or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Private,
    Group { leader: PeerId },
}

/// Something a session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Every expected link is attached.
    Activated { session: SessionName },
    /// A message was sent or received completely.
    Delivered(DeliveredMessage),
    /// A peer deleted the chat or logged out.
    PeerLeft {
        session: SessionName,
        peer: PeerId,
        reason: MessageType,
    },
    /// Call signalling arrived in a private session.
    CallSignal {
        session: SessionName,
        peer: PeerId,
        message_type: MessageType,
        payload: String,
    },
    /// A link closed or failed; the session itself stays up.
    LinkLost {
        session: SessionName,
        peer: PeerId,
        error: Option<String>,
    },
    /// An outbound dial gave up.
    DialFailed {
        session: SessionName,
        peer: PeerId,
        error: String,
    },
}

/// What every session needs from the node.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<NodeConfig>,
    /// Port our listener is actually bound to.
    pub origin_port: u16,
    pub resolver: Arc<dyn PeerResolver>,
    pub events: mpsc::Sender<SessionEvent>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("peer_id", &self.config.peer_id)
            .field("origin_port", &self.origin_port)
            .finish_non_exhaustive()
    }
}

struct Link {
    id: u64,
    dialer: PeerId,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

struct Inner {
    name: SessionName,
    me: PeerId,
    kind: SessionKind,
    expected: BTreeSet<PeerId>,
    context: SessionContext,
    links: Mutex<HashMap<PeerId, Link>>,
    history: StdMutex<Vec<DeliveredMessage>>,
    state: watch::Sender<SessionState>,
    shutdown: ShutdownHandle,
    next_link: AtomicU64,
    dialing: AtomicUsize,
}

/// A private or group chat. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl ChatSession {
    /// Creates a pending session. `me` must be a participant.
    pub fn new(name: SessionName, kind: SessionKind, context: SessionContext) -> NodeResult<Self> {
        let me = context.config.peer_id;
        if !name.contains(me) {
            return Err(NodeError::config(format!("{me} is not part of {name}")));
        }
        if let SessionKind::Group { leader } = kind
            && !name.contains(leader)
        {
            return Err(NodeError::config(format!("leader {leader} is not part of {name}")));
        }
        let (state, _) = watch::channel(SessionState::Pending);
        Ok(Self {
            inner: Arc::new(Inner {
                expected: name.others(me).into_iter().collect(),
                name,
                me,
                kind,
                context,
                links: Mutex::new(HashMap::new()),
                history: StdMutex::new(Vec::new()),
                state,
                shutdown: ShutdownHandle::new(),
                next_link: AtomicU64::new(1),
                dialing: AtomicUsize::new(0),
            }),
        })
    }

    pub fn name(&self) -> &SessionName {
        &self.inner.name
    }

    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    pub fn is_private(&self) -> bool {
        self.inner.kind == SessionKind::Private
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Participants other than us.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.expected.iter().copied().collect()
    }

    /// Peers with an attached link.
    pub async fn linked_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.inner.links.lock().await.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Messages sent and received so far, in delivery order.
    pub fn history(&self) -> Vec<DeliveredMessage> {
        self.inner
            .history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    /// Waits until the session leaves `Pending`.
    pub async fn wait_active(&self, timeout: Duration) -> NodeResult<()> {
        let mut rx = self.inner.state.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| *state != SessionState::Pending)
                .await
                .map(|state| *state)
                .ok()
        })
        .await;
        match reached {
            Ok(Some(SessionState::Active)) => Ok(()),
            Ok(_) => Err(NodeError::SessionClosed(self.inner.name.clone())),
            Err(_) => Err(NodeError::NotActive(self.inner.name.clone())),
        }
    }

    /// Adopts a connected stream as the link to `peer`.
    ///
    /// `dialer` is the side that opened the connection. Returns false if the
    /// link was refused: unknown peer, closed session, or an occupied slot
    /// that is kept.
    pub async fn attach(&self, peer: PeerId, stream: TcpStream, dialer: PeerId) -> bool {
        if !self.admits(peer) {
            return false;
        }
        let mut links = self.inner.links.lock().await;
        let (attached, activated) = self.insert_link(&mut links, peer, stream, dialer);
        drop(links);
        if activated {
            self.activated().await;
        }
        attached
    }

    fn admits(&self, peer: PeerId) -> bool {
        let name = &self.inner.name;
        if !self.inner.expected.contains(&peer) {
            warn!(session = %name, %peer, "Refusing link from non-participant");
            return false;
        }
        if self.state() == SessionState::Closed {
            debug!(session = %name, %peer, "Refusing link to closed session");
            return false;
        }
        true
    }

    /// Puts a link in the slot of `peer`. Returns whether it was attached
    /// and whether that activated the session.
    ///
    /// In a private session both sides may dial at once; the link dialled by
    /// the smaller id wins on both sides. The losing link is retired rather
    /// than dropped, so whatever the peer already wrote on it is still
    /// dispatched.
    fn insert_link(
        &self,
        links: &mut HashMap<PeerId, Link>,
        peer: PeerId,
        stream: TcpStream,
        dialer: PeerId,
    ) -> (bool, bool) {
        let name = &self.inner.name;
        let private = self.is_private();
        if let Some(existing) = links.get(&peer) {
            let replace =
                existing.reader.is_finished() || (private && dialer <= existing.dialer);
            if !replace {
                if private {
                    debug!(session = %name, %peer, %dialer, "Losing link, retiring it");
                    let link = self.spawn_link(peer, stream, dialer);
                    self.retire(link);
                } else {
                    debug!(session = %name, %peer, %dialer, "Link slot occupied, dropping new link");
                }
                return (false, false);
            }
            debug!(session = %name, %peer, %dialer, "Replacing link");
            if let Some(old) = links.remove(&peer) {
                self.retire(old);
            }
        }

        let link = self.spawn_link(peer, stream, dialer);
        links.insert(peer, link);
        debug!(session = %name, %peer, linked = links.len(), expected = self.inner.expected.len(), "Link attached");

        let activated = links.len() == self.inner.expected.len()
            && self.inner.state.send_if_modified(|state| {
                if *state == SessionState::Pending {
                    *state = SessionState::Active;
                    true
                } else {
                    false
                }
            });
        (true, activated)
    }

    fn spawn_link(&self, peer: PeerId, stream: TcpStream, dialer: PeerId) -> Link {
        let _ = stream.set_nodelay(true);
        let (read, writer) = stream.into_split();
        let id = self.inner.next_link.fetch_add(1, Ordering::Relaxed);
        let reader = tokio::spawn(self.clone().read_loop(peer, id, read));
        Link {
            id,
            dialer,
            writer,
            reader,
        }
    }

    /// Takes a link out of service without losing inbound frames.
    ///
    /// The dialer of the link closes its write side; the other side keeps
    /// its write half open until its reader sees that close. Either way the
    /// reader runs until end of stream.
    fn retire(&self, link: Link) {
        let Link {
            dialer,
            writer,
            reader,
            ..
        } = link;
        if reader.is_finished() || dialer == self.inner.me {
            drop(writer);
            return;
        }
        tokio::spawn(async move {
            let _ = reader.await;
            drop(writer);
        });
    }

    async fn activated(&self) {
        info!(session = %self.inner.name, "Session active");
        self.emit(SessionEvent::Activated {
            session: self.inner.name.clone(),
        })
        .await;
    }

    /// Private sessions go back to `Pending` once their link is gone, so
    /// sends wait for a redial instead of failing outright.
    fn demote_if_unlinked(&self, links: &HashMap<PeerId, Link>) {
        if !self.is_private() || !links.is_empty() {
            return;
        }
        let demoted = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Pending;
                true
            } else {
                false
            }
        });
        if demoted {
            debug!(session = %self.inner.name, "Link gone, session pending again");
        }
    }

    /// True while an outbound dial of this session is in progress.
    pub fn is_dialing(&self) -> bool {
        self.inner.dialing.load(Ordering::Acquire) > 0
    }

    /// Dials `peer` in the background and attaches the link once the
    /// handshake envelope is written. Refused connections are retried until
    /// the session closes.
    pub fn spawn_dial(&self, peer: PeerId, handshake: MessageType) {
        let session = self.clone();
        session.inner.dialing.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let result = session.dial(peer, handshake).await;
            session.inner.dialing.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = result {
                if matches!(e, NodeError::Cancelled) {
                    return;
                }
                warn!(session = %session.inner.name, %peer, error = %e, "Dial failed");
                session
                    .emit(SessionEvent::DialFailed {
                        session: session.inner.name.clone(),
                        peer,
                        error: e.to_string(),
                    })
                    .await;
            }
        });
    }

    async fn dial(&self, peer: PeerId, handshake: MessageType) -> NodeResult<()> {
        let context = &self.inner.context;
        let target = context
            .resolver
            .resolve(peer)
            .await?
            .ok_or(NodeError::UnknownPeer(peer))?;
        debug!(session = %self.inner.name, %peer, address = %target.address, "Dialing");

        let mut stream = connect_with_retry(
            &target.address,
            context.config.connect_retry_interval,
            &self.inner.shutdown,
        )
        .await?;
        let envelope = Envelope::control(
            self.inner.name.as_str(),
            context.origin_port,
            handshake,
            self.inner.me,
            "",
        );
        if !self.admits(peer) {
            return Ok(());
        }
        // The link is in place before the peer can see the handshake.
        let mut links = self.inner.links.lock().await;
        write_envelope(&mut stream, &envelope).await?;
        let (_, activated) = self.insert_link(&mut links, peer, stream, self.inner.me);
        drop(links);
        if activated {
            self.activated().await;
        }
        Ok(())
    }

    /// Sends a text message to every linked peer.
    pub async fn send_text(&self, text: &str) -> NodeResult<DeliveredMessage> {
        self.wait_active(self.inner.context.config.activation_timeout)
            .await?;
        let envelope = Envelope::text(
            self.inner.name.as_str(),
            self.inner.context.origin_port,
            self.inner.me,
            text,
        );

        let mut links = self.inner.links.lock().await;
        let mut failed = Vec::new();
        for (peer, link) in links.iter_mut() {
            if let Err(e) = write_envelope(&mut link.writer, &envelope).await {
                failed.push((*peer, e));
            }
        }
        self.drop_failed(&mut links, failed).await?;
        drop(links);

        let message = DeliveredMessage::text(
            self.inner.name.clone(),
            self.inner.me,
            Direction::Sent,
            text,
        );
        self.record(message.clone()).await;
        Ok(message)
    }

    /// Sends an image read from `path`.
    pub async fn send_image(&self, path: &Path) -> NodeResult<DeliveredMessage> {
        self.send_attachment(ContentKind::Image, path).await
    }

    /// Sends a file read from `path`.
    pub async fn send_file(&self, path: &Path) -> NodeResult<DeliveredMessage> {
        self.send_attachment(ContentKind::File, path).await
    }

    async fn send_attachment(&self, kind: ContentKind, path: &Path) -> NodeResult<DeliveredMessage> {
        let size = tokio::fs::metadata(path).await?.len();
        self.wait_active(self.inner.context.config.activation_timeout)
            .await?;

        let message_type = match kind {
            ContentKind::Image => MessageType::Image,
            _ => MessageType::File,
        };
        let resource = transfer::sanitize_filename(&path.to_string_lossy());
        let envelope = Envelope::transfer(
            self.inner.name.as_str(),
            self.inner.context.origin_port,
            message_type,
            self.inner.me,
            resource.as_str(),
            size,
        );
        let max_chunk = self.inner.context.config.max_chunk_size;

        let mut links = self.inner.links.lock().await;
        let mut failed = Vec::new();
        for (peer, link) in links.iter_mut() {
            if let Err(e) = send_file_on(&mut link.writer, &envelope, path, max_chunk).await {
                failed.push((*peer, e));
            }
        }
        self.drop_failed(&mut links, failed).await?;
        drop(links);

        info!(session = %self.inner.name, kind = kind.label(), %resource, size, "Sent attachment");
        let message = DeliveredMessage::attachment(
            self.inner.name.clone(),
            self.inner.me,
            Direction::Sent,
            kind,
            resource,
            path,
            size,
        );
        self.record(message.clone()).await;
        Ok(message)
    }

    /// Sends a control envelope to every linked peer, whatever the state.
    pub async fn send_control(&self, message_type: MessageType, payload: &str) -> NodeResult<()> {
        let envelope = Envelope::control(
            self.inner.name.as_str(),
            self.inner.context.origin_port,
            message_type,
            self.inner.me,
            payload,
        );
        let mut links = self.inner.links.lock().await;
        let mut failed = Vec::new();
        for (peer, link) in links.iter_mut() {
            if let Err(e) = write_envelope(&mut link.writer, &envelope).await {
                failed.push((*peer, e));
            }
        }
        self.drop_failed(&mut links, failed).await
    }

    /// Removes links whose write failed. Errors if no link is left.
    async fn drop_failed(
        &self,
        links: &mut HashMap<PeerId, Link>,
        failed: Vec<(PeerId, NodeError)>,
    ) -> NodeResult<()> {
        for (peer, error) in failed {
            warn!(session = %self.inner.name, %peer, error = %error, "Send failed, dropping link");
            if let Some(link) = links.remove(&peer) {
                link.reader.abort();
            }
            // The link map is locked here; never wait on the owner.
            let lost = SessionEvent::LinkLost {
                session: self.inner.name.clone(),
                peer,
                error: Some(error.to_string()),
            };
            if self.inner.context.events.try_send(lost).is_err() {
                debug!(session = %self.inner.name, %peer, "Link loss not reported, owner busy");
            }
        }
        self.demote_if_unlinked(links);
        if links.is_empty() {
            return Err(NodeError::NoLinks(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Closes the session, optionally telling every peer why first.
    pub async fn close(&self, notify: Option<MessageType>) {
        let previous = self.inner.state.send_replace(SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }
        if let Some(message_type) = notify
            && let Err(e) = self.send_control(message_type, "").await
        {
            debug!(session = %self.inner.name, error = %e, "Could not notify peers");
        }
        self.inner.shutdown.trigger();

        let mut links = self.inner.links.lock().await;
        for (_, mut link) in links.drain() {
            link.reader.abort();
            let _ = link.writer.shutdown().await;
        }
        info!(session = %self.inner.name, "Session closed");
    }

    async fn read_loop(self, peer: PeerId, link_id: u64, mut reader: OwnedReadHalf) {
        let shutdown = self.inner.shutdown.clone();
        let mut state = self.inner.state.subscribe();
        let state = tokio::select! {
            state = async {
                state
                    .wait_for(|s| *s != SessionState::Pending)
                    .await
                    .map(|s| *s)
                    .ok()
            } => state,
            _ = shutdown.cancelled() => return,
        };
        if state != Some(SessionState::Active) {
            return;
        }

        let error = loop {
            let next = tokio::select! {
                next = read_envelope(&mut reader) => next,
                _ = shutdown.cancelled() => return,
            };
            match next {
                Ok(Some(Some(envelope))) => {
                    if let Err(e) = self.dispatch(peer, envelope, &mut reader).await {
                        break Some(e.to_string());
                    }
                }
                Ok(Some(None)) => {}
                Ok(None) => break None,
                Err(e) => break Some(e.to_string()),
            }
        };
        self.link_closed(peer, link_id, error).await;
    }

    async fn link_closed(&self, peer: PeerId, link_id: u64, error: Option<String>) {
        let mut links = self.inner.links.lock().await;
        if links.get(&peer).is_none_or(|link| link.id != link_id) {
            return;
        }
        links.remove(&peer);
        self.demote_if_unlinked(&links);
        drop(links);
        debug!(session = %self.inner.name, %peer, error = ?error, "Link closed");
        self.emit(SessionEvent::LinkLost {
            session: self.inner.name.clone(),
            peer,
            error,
        })
        .await;
    }

    async fn dispatch(
        &self,
        peer: PeerId,
        envelope: Envelope,
        reader: &mut OwnedReadHalf,
    ) -> NodeResult<()> {
        let name = &self.inner.name;
        if envelope.session_name != name.as_str() || envelope.sender != peer {
            debug!(
                session = %name,
                %peer,
                frame_session = %envelope.session_name,
                sender = %envelope.sender,
                "Dropping frame for another session"
            );
            if envelope.message_type.is_transfer() {
                self.discard(reader, envelope.declared_length).await?;
            }
            return Ok(());
        }

        match envelope.message_type {
            MessageType::Text => {
                let message = DeliveredMessage::text(
                    name.clone(),
                    peer,
                    Direction::Received,
                    envelope.payload,
                );
                self.record(message).await;
            }
            MessageType::Image => {
                self.receive_attachment(peer, ContentKind::Image, envelope, reader)
                    .await?;
            }
            MessageType::File => {
                self.receive_attachment(peer, ContentKind::File, envelope, reader)
                    .await?;
            }
            reason @ (MessageType::PeerDeletedChat | MessageType::PeerLoggedOut) => {
                info!(session = %name, %peer, reason = %reason, "Peer left");
                self.emit(SessionEvent::PeerLeft {
                    session: name.clone(),
                    peer,
                    reason,
                })
                .await;
            }
            message_type @ (MessageType::VideoRequest | MessageType::VideoResponse) => {
                if self.is_private() {
                    self.emit(SessionEvent::CallSignal {
                        session: name.clone(),
                        peer,
                        message_type,
                        payload: envelope.payload,
                    })
                    .await;
                } else {
                    debug!(session = %name, %peer, "Dropping call signal in group session");
                }
            }
            other => {
                debug!(session = %name, %peer, kind = %other, "Dropping unexpected message type");
            }
        }
        Ok(())
    }

    async fn receive_attachment(
        &self,
        peer: PeerId,
        kind: ContentKind,
        envelope: Envelope,
        reader: &mut OwnedReadHalf,
    ) -> NodeResult<()> {
        let config = &self.inner.context.config;
        let path = transfer::destination(&config.download_dir, kind, &envelope.payload);
        let size = envelope.declared_length;

        let file = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::File::create(&path).await
        }
        .await;
        let mut file = match file {
            Ok(file) => file,
            Err(e) => {
                warn!(session = %self.inner.name, path = %path.display(), error = %e, "Cannot store attachment, discarding");
                return self.discard(reader, size).await;
            }
        };

        receive_chunked(reader, &mut file, size, config.max_chunk_size).await?;
        info!(session = %self.inner.name, %peer, kind = kind.label(), path = %path.display(), size, "Received attachment");

        let message = DeliveredMessage::attachment(
            self.inner.name.clone(),
            peer,
            Direction::Received,
            kind,
            envelope.payload,
            path,
            size,
        );
        self.record(message).await;
        Ok(())
    }

    /// Skips the raw bytes of a transfer that is not stored.
    async fn discard(&self, reader: &mut OwnedReadHalf, size: u64) -> NodeResult<()> {
        let max_chunk = self.inner.context.config.max_chunk_size;
        receive_chunked(reader, &mut tokio::io::sink(), size, max_chunk).await?;
        Ok(())
    }

    async fn record(&self, message: DeliveredMessage) {
        if let Ok(mut history) = self.inner.history.lock() {
            history.push(message.clone());
        }
        self.emit(SessionEvent::Delivered(message)).await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.inner.context.events.send(event).await.is_err() {
            debug!(session = %self.inner.name, "Session event dropped, owner gone");
        }
    }
}

/// Writes a transfer envelope followed by the bytes of `path`.
async fn send_file_on(
    writer: &mut OwnedWriteHalf,
    envelope: &Envelope,
    path: &Path,
    max_chunk: usize,
) -> NodeResult<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    write_envelope(writer, envelope).await?;
    send_chunked(&mut file, writer, envelope.declared_length, max_chunk).await
}
