//! Session manager.
//!
//! A single task owns the session registry, the links parked for groups that
//! do not exist yet, and the call state. Everything else talks to it through
//! a [`SessionManagerHandle`]; sessions report back over a second channel.
//! The manager never waits on a session: attaching, closing and call
//! signalling are spawned, and sends happen on session clones outside the
//! task.

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_core::{Peer, PeerAddress, PeerId, SessionName};
use parley_protocol::{CallAnswer, CallOffer, Envelope, MediaPorts, MessageType};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::directory::{PeerBook, PeerResolver};
use crate::error::{NodeError, NodeResult};
use crate::event::NodeEvent;
use crate::media::{MediaBackend, MediaListeners, MediaPeer, MediaStreamSession};
use crate::mesh::outbound_targets;
use crate::session::{ChatSession, SessionContext, SessionEvent, SessionKind, SessionState};
use crate::signals::ShutdownHandle;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Commands handled by the manager task.
pub enum ManagerCommand {
    OpenPrivate {
        peer: PeerId,
        reply: oneshot::Sender<NodeResult<ChatSession>>,
    },
    OpenGroup {
        peers: Vec<PeerId>,
        reply: oneshot::Sender<NodeResult<ChatSession>>,
    },
    /// First frame of an accepted connection.
    Inbound {
        stream: TcpStream,
        remote: SocketAddr,
        envelope: Envelope,
    },
    Session {
        name: SessionName,
        reply: oneshot::Sender<Option<ChatSession>>,
    },
    List {
        reply: oneshot::Sender<Vec<ChatSession>>,
    },
    /// Deletes a session and tells its peers.
    Remove {
        name: SessionName,
        reply: oneshot::Sender<NodeResult<()>>,
    },
    RequestCall {
        name: SessionName,
        reply: oneshot::Sender<NodeResult<()>>,
    },
    AcceptCall {
        name: SessionName,
        reply: oneshot::Sender<NodeResult<()>>,
    },
    RejectCall {
        name: SessionName,
        reply: oneshot::Sender<NodeResult<()>>,
    },
    HangUp {
        reply: oneshot::Sender<NodeResult<()>>,
    },
    /// A call's media loops stopped, or its signalling failed.
    CallFinished { call_id: u64, reason: String },
    /// Logs out of every session and stops the task.
    Shutdown { reply: oneshot::Sender<()> },
}

struct ParkedLink {
    peer: PeerId,
    stream: TcpStream,
    since: Instant,
}

enum Call {
    Idle,
    Outgoing {
        id: u64,
        session: SessionName,
        peer: PeerId,
        listeners: MediaListeners,
    },
    Incoming {
        id: u64,
        session: SessionName,
        peer: PeerId,
        ports: MediaPorts,
    },
    Live {
        id: u64,
        session: SessionName,
        peer: PeerId,
        stream: MediaStreamSession,
    },
}

impl Call {
    fn id(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Outgoing { id, .. } | Self::Incoming { id, .. } | Self::Live { id, .. } => {
                Some(*id)
            }
        }
    }

    fn session(&self) -> Option<(&SessionName, PeerId)> {
        match self {
            Self::Idle => None,
            Self::Outgoing { session, peer, .. }
            | Self::Incoming { session, peer, .. }
            | Self::Live { session, peer, .. } => Some((session, *peer)),
        }
    }
}

/// Owns every chat session of the node.
pub struct SessionManager {
    config: Arc<NodeConfig>,
    context: SessionContext,
    peers: Arc<PeerBook>,
    media: Arc<dyn MediaBackend>,
    sessions: HashMap<SessionName, ChatSession>,
    parked: HashMap<SessionName, Vec<ParkedLink>>,
    call: Call,
    next_call_id: u64,
    commands_tx: mpsc::Sender<ManagerCommand>,
    commands: mpsc::Receiver<ManagerCommand>,
    session_events: mpsc::Receiver<SessionEvent>,
    output: mpsc::Sender<NodeEvent>,
}

impl SessionManager {
    /// Creates a manager. `origin_port` is the port our listener is bound to.
    pub fn new(
        config: Arc<NodeConfig>,
        origin_port: u16,
        peers: Arc<PeerBook>,
        media: Arc<dyn MediaBackend>,
        output: mpsc::Sender<NodeEvent>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, session_events) = mpsc::channel(EVENT_BUFFER);
        let context = SessionContext {
            config: config.clone(),
            origin_port,
            resolver: peers.clone(),
            events: events_tx,
        };
        Self {
            config,
            context,
            peers,
            media,
            sessions: HashMap::new(),
            parked: HashMap::new(),
            call: Call::Idle,
            next_call_id: 1,
            commands_tx,
            commands,
            session_events,
            output,
        }
    }

    /// Returns a handle for talking to the manager once it runs.
    pub fn handle(&self) -> SessionManagerHandle {
        SessionManagerHandle {
            tx: self.commands_tx.clone(),
        }
    }

    fn me(&self) -> PeerId {
        self.config.peer_id
    }

    /// Runs until a `Shutdown` command or `shutdown` fires.
    pub async fn run(mut self, shutdown: ShutdownHandle) {
        let period = self
            .config
            .pending_link_ttl
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut prune = tokio::time::interval(period);
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(peer = %self.me(), "Session manager started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ManagerCommand::Shutdown { reply }) => {
                        self.close_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.session_events.recv() => self.handle_session_event(event).await,
                _ = prune.tick() => self.prune_parked(),
                _ = shutdown.cancelled() => {
                    self.close_all().await;
                    break;
                }
            }
        }
        info!("Session manager stopped");
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::OpenPrivate { peer, reply } => {
                let _ = reply.send(self.open_private(peer).await);
            }
            ManagerCommand::OpenGroup { peers, reply } => {
                let _ = reply.send(self.open_group(peers).await);
            }
            ManagerCommand::Inbound {
                stream,
                remote,
                envelope,
            } => self.route_inbound(stream, remote, envelope).await,
            ManagerCommand::Session { name, reply } => {
                let _ = reply.send(self.sessions.get(&name).cloned());
            }
            ManagerCommand::List { reply } => {
                let mut sessions: Vec<_> = self.sessions.values().cloned().collect();
                sessions.sort_by(|a, b| a.name().cmp(b.name()));
                let _ = reply.send(sessions);
            }
            ManagerCommand::Remove { name, reply } => self.remove(name, reply).await,
            ManagerCommand::RequestCall { name, reply } => {
                let _ = reply.send(self.request_call(&name).await);
            }
            ManagerCommand::AcceptCall { name, reply } => {
                let _ = reply.send(self.accept_call(&name).await);
            }
            ManagerCommand::RejectCall { name, reply } => {
                let _ = reply.send(self.reject_call(&name));
            }
            ManagerCommand::HangUp { reply } => {
                let _ = reply.send(self.hang_up().await);
            }
            ManagerCommand::CallFinished { call_id, reason } => {
                if self.call.id() == Some(call_id) {
                    self.end_call(reason).await;
                }
            }
            ManagerCommand::Shutdown { .. } => {}
        }
    }

    async fn open_private(&mut self, peer: PeerId) -> NodeResult<ChatSession> {
        let name = SessionName::private(self.me(), peer)?;
        if let Some(session) = self.sessions.get(&name) {
            // A private session whose link dropped is pending again.
            if session.state() == SessionState::Pending && !session.is_dialing() {
                info!(session = %name, %peer, "Redialing");
                session.spawn_dial(peer, MessageType::PrivateRequest);
            }
            return Ok(session.clone());
        }
        let session = self.create(name, SessionKind::Private, self.me()).await?;
        session.spawn_dial(peer, MessageType::PrivateRequest);
        Ok(session)
    }

    async fn open_group(&mut self, mut peers: Vec<PeerId>) -> NodeResult<ChatSession> {
        peers.push(self.me());
        let name = SessionName::from_ids(peers)?;
        if !name.is_group() {
            return Err(NodeError::config(
                "a group needs at least three participants",
            ));
        }
        if let Some(session) = self.sessions.get(&name) {
            return Ok(session.clone());
        }

        let me = self.me();
        let session = self
            .create(name.clone(), SessionKind::Group { leader: me }, me)
            .await?;
        for target in outbound_targets(me, me, &name.participants()) {
            session.spawn_dial(target, MessageType::GroupRequest);
        }
        Ok(session)
    }

    async fn create(
        &mut self,
        name: SessionName,
        kind: SessionKind,
        initiator: PeerId,
    ) -> NodeResult<ChatSession> {
        let session = ChatSession::new(name.clone(), kind, self.context.clone())?;
        info!(session = %name, %initiator, ?kind, "Session created");
        self.sessions.insert(name.clone(), session.clone());
        self.emit(NodeEvent::SessionOpened {
            session: name,
            initiator,
        })
        .await;
        Ok(session)
    }

    async fn route_inbound(&mut self, stream: TcpStream, remote: SocketAddr, envelope: Envelope) {
        let me = self.me();
        let sender = envelope.sender;
        let kind = envelope.message_type;
        let Some(name) = envelope.session() else {
            debug!(%remote, session = %envelope.session_name, "Dropping connection with bad session name");
            return;
        };
        if sender == me || !name.contains(me) || !name.contains(sender) {
            debug!(%remote, session = %name, %sender, "Dropping connection for a session we are not in");
            return;
        }
        self.peers.learn(Peer::new(
            sender,
            PeerAddress::new(remote.ip().to_string(), envelope.origin_port),
        ));

        match kind {
            MessageType::PrivateRequest if name.is_private() => {
                let session = match self.sessions.get(&name).cloned() {
                    Some(session) => session,
                    None => match self.create(name, SessionKind::Private, sender).await {
                        Ok(session) => session,
                        Err(e) => {
                            warn!(error = %e, "Cannot create private session");
                            return;
                        }
                    },
                };
                spawn_attach(session, sender, stream);
            }
            MessageType::GroupRequest if name.is_group() => {
                if let Some(session) = self.sessions.get(&name) {
                    spawn_attach(session.clone(), sender, stream);
                    return;
                }
                let kind = SessionKind::Group { leader: sender };
                let session = match self.create(name.clone(), kind, sender).await {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(error = %e, "Cannot create group session");
                        return;
                    }
                };
                spawn_attach(session.clone(), sender, stream);
                for target in outbound_targets(me, sender, &name.participants()) {
                    session.spawn_dial(target, MessageType::GroupResponse);
                }
                for link in self.parked.remove(&name).unwrap_or_default() {
                    debug!(session = %name, peer = %link.peer, "Adopting parked link");
                    spawn_attach(session.clone(), link.peer, link.stream);
                }
            }
            MessageType::GroupResponse if name.is_group() => match self.sessions.get(&name) {
                Some(session) => spawn_attach(session.clone(), sender, stream),
                None => {
                    debug!(session = %name, %sender, "Parking link until the group request arrives");
                    self.parked.entry(name).or_default().push(ParkedLink {
                        peer: sender,
                        stream,
                        since: Instant::now(),
                    });
                }
            },
            MessageType::PrivateResponse => {
                debug!(session = %name, %sender, "Private response received");
            }
            other => {
                debug!(session = %name, %sender, kind = %other, "Dropping connection opened with a non-handshake frame");
            }
        }
    }

    fn prune_parked(&mut self) {
        let ttl = self.config.pending_link_ttl;
        self.parked.retain(|name, links| {
            links.retain(|link| {
                let keep = link.since.elapsed() < ttl;
                if !keep {
                    debug!(session = %name, peer = %link.peer, "Dropping stale parked link");
                }
                keep
            });
            !links.is_empty()
        });
    }

    async fn remove(&mut self, name: SessionName, reply: oneshot::Sender<NodeResult<()>>) {
        let Some(session) = self.sessions.remove(&name) else {
            let _ = reply.send(Err(NodeError::SessionNotFound(name)));
            return;
        };
        self.end_call_in(&name, "chat deleted").await;
        self.emit(NodeEvent::SessionEnded {
            session: name,
            peer: None,
            reason: "deleted".to_string(),
        })
        .await;
        tokio::spawn(async move {
            session.close(Some(MessageType::PeerDeletedChat)).await;
            let _ = reply.send(Ok(()));
        });
    }

    /// Drops a session without telling its peers.
    async fn discard(&mut self, name: &SessionName, peer: Option<PeerId>, reason: &str) {
        self.end_call_in(name, reason).await;
        if let Some(session) = self.sessions.remove(name) {
            tokio::spawn(async move { session.close(None).await });
            self.emit(NodeEvent::SessionEnded {
                session: name.clone(),
                peer,
                reason: reason.to_string(),
            })
            .await;
        }
    }

    async fn close_all(&mut self) {
        self.end_call("logged out".to_string()).await;
        let mut closing = JoinSet::new();
        for (_, session) in self.sessions.drain() {
            closing.spawn(async move { session.close(Some(MessageType::PeerLoggedOut)).await });
        }
        while closing.join_next().await.is_some() {}
        self.parked.clear();
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Activated { session } => {
                self.emit(NodeEvent::SessionActive { session }).await;
            }
            SessionEvent::Delivered(message) => self.emit(NodeEvent::Message(message)).await,
            SessionEvent::PeerLeft {
                session,
                peer,
                reason,
            } => {
                let reason = match reason {
                    MessageType::PeerLoggedOut => {
                        self.peers.mark_offline(peer);
                        "logged out"
                    }
                    _ => "deleted the chat",
                };
                let private = self
                    .sessions
                    .get(&session)
                    .is_some_and(ChatSession::is_private);
                if private {
                    self.discard(&session, Some(peer), reason).await;
                } else {
                    self.emit(NodeEvent::PeerLeft {
                        session,
                        peer,
                        reason: reason.to_string(),
                    })
                    .await;
                }
            }
            SessionEvent::CallSignal {
                session,
                peer,
                message_type,
                payload,
            } => match message_type {
                MessageType::VideoRequest => self.call_requested(session, peer, &payload).await,
                MessageType::VideoResponse => self.call_answered(session, peer, &payload).await,
                _ => {}
            },
            SessionEvent::LinkLost {
                session,
                peer,
                error,
            } => {
                self.emit(NodeEvent::LinkLost {
                    session,
                    peer,
                    error,
                })
                .await;
            }
            SessionEvent::DialFailed {
                session,
                peer,
                error,
            } => {
                let unreachable = self.sessions.get(&session).is_some_and(|s| {
                    s.is_private() && s.state() == SessionState::Pending
                });
                self.emit(NodeEvent::DialFailed {
                    session: session.clone(),
                    peer,
                    error,
                })
                .await;
                if unreachable {
                    self.discard(&session, Some(peer), "unreachable").await;
                }
            }
        }
    }

    fn call_session(&self, name: &SessionName) -> NodeResult<ChatSession> {
        let session = self
            .sessions
            .get(name)
            .ok_or_else(|| NodeError::SessionNotFound(name.clone()))?;
        if !session.is_private() {
            return Err(NodeError::call("calls are only possible in private chats"));
        }
        Ok(session.clone())
    }

    async fn request_call(&mut self, name: &SessionName) -> NodeResult<()> {
        if !matches!(self.call, Call::Idle) {
            return Err(NodeError::call("already in a call"));
        }
        let session = self.call_session(name)?;
        if session.state() != SessionState::Active {
            return Err(NodeError::NotActive(name.clone()));
        }
        let peer = session
            .peers()
            .first()
            .copied()
            .ok_or_else(|| NodeError::NoLinks(name.clone()))?;

        let listeners = MediaListeners::bind(&self.config.bind_host, &self.config.media).await?;
        let offer = CallOffer::new(listeners.ports()?);
        let id = self.next_call();
        info!(session = %name, %peer, ports = %offer.encode(), "Requesting call");
        self.signal(id, session, MessageType::VideoRequest, offer.encode());
        self.call = Call::Outgoing {
            id,
            session: name.clone(),
            peer,
            listeners,
        };
        Ok(())
    }

    async fn call_requested(&mut self, name: SessionName, peer: PeerId, payload: &str) {
        let Some(session) = self.sessions.get(&name).cloned() else {
            return;
        };
        if !matches!(self.call, Call::Idle) {
            info!(session = %name, %peer, "Already in a call, rejecting");
            tokio::spawn(async move {
                let answer = CallAnswer::Reject.encode();
                if let Err(e) = session.send_control(MessageType::VideoResponse, &answer).await {
                    debug!(error = %e, "Could not send call rejection");
                }
            });
            return;
        }

        let ports = CallOffer::parse(payload).ports_or(self.config.media.ports());
        let id = self.next_call();
        self.call = Call::Incoming {
            id,
            session: name.clone(),
            peer,
            ports,
        };
        if self.config.auto_accept_calls {
            if let Err(e) = self.accept_call(&name).await {
                warn!(session = %name, error = %e, "Automatic call accept failed");
            }
        } else {
            info!(session = %name, %peer, "Incoming call");
            self.emit(NodeEvent::CallRequested {
                session: name,
                peer,
            })
            .await;
        }
    }

    async fn accept_call(&mut self, name: &SessionName) -> NodeResult<()> {
        let (id, peer, ports) = match &self.call {
            Call::Incoming {
                id,
                session,
                peer,
                ports,
            } if session == name => (*id, *peer, *ports),
            _ => return Err(NodeError::call(format!("no incoming call in {name}"))),
        };
        let accepted = async {
            let session = self.call_session(name)?;
            let host = self.peer_host(peer).await?;
            let listeners =
                MediaListeners::bind(&self.config.bind_host, &self.config.media).await?;
            let answer = CallAnswer::Accept(Some(listeners.ports()?));
            let stream = self.start_stream(id, peer, host, ports, listeners)?;
            Ok::<_, NodeError>((session, answer, stream))
        }
        .await;

        match accepted {
            Ok((session, answer, stream)) => {
                self.signal(id, session, MessageType::VideoResponse, answer.encode());
                self.call = Call::Live {
                    id,
                    session: name.clone(),
                    peer,
                    stream,
                };
                self.emit(NodeEvent::CallStarted {
                    session: name.clone(),
                    peer,
                })
                .await;
                Ok(())
            }
            Err(e) => {
                self.call = Call::Idle;
                if let Ok(session) = self.call_session(name) {
                    self.signal(id, session, MessageType::VideoResponse, CallAnswer::Reject.encode());
                }
                Err(e)
            }
        }
    }

    fn reject_call(&mut self, name: &SessionName) -> NodeResult<()> {
        let id = match &self.call {
            Call::Incoming { id, session, .. } if session == name => *id,
            _ => return Err(NodeError::call(format!("no incoming call in {name}"))),
        };
        self.call = Call::Idle;
        let session = self.call_session(name)?;
        info!(session = %name, "Rejecting call");
        self.signal(id, session, MessageType::VideoResponse, CallAnswer::Reject.encode());
        Ok(())
    }

    async fn call_answered(&mut self, name: SessionName, peer: PeerId, payload: &str) {
        let waiting = matches!(
            &self.call,
            Call::Outgoing { session, peer: callee, .. } if *session == name && *callee == peer
        );
        if !waiting {
            debug!(session = %name, %peer, "Dropping unexpected call answer");
            return;
        }
        let answer = match CallAnswer::parse(payload) {
            Ok(answer) => answer,
            Err(e) => {
                debug!(session = %name, error = %e, "Dropping malformed call answer");
                return;
            }
        };
        let Call::Outgoing { id, listeners, .. } = mem::replace(&mut self.call, Call::Idle) else {
            return;
        };

        match answer {
            CallAnswer::Reject => {
                info!(session = %name, %peer, "Call rejected");
                self.emit(NodeEvent::CallRejected {
                    session: name,
                    peer,
                })
                .await;
            }
            CallAnswer::Accept(ports) => {
                let ports = ports.unwrap_or(self.config.media.ports());
                let started = match self.peer_host(peer).await {
                    Ok(host) => self.start_stream(id, peer, host, ports, listeners),
                    Err(e) => Err(e),
                };
                match started {
                    Ok(stream) => {
                        self.call = Call::Live {
                            id,
                            session: name.clone(),
                            peer,
                            stream,
                        };
                        self.emit(NodeEvent::CallStarted {
                            session: name,
                            peer,
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!(session = %name, %peer, error = %e, "Cannot start call");
                        self.emit(NodeEvent::CallEnded {
                            session: name,
                            peer,
                            reason: e.to_string(),
                        })
                        .await;
                    }
                }
            }
        }
    }

    async fn hang_up(&mut self) -> NodeResult<()> {
        match &self.call {
            Call::Idle => Err(NodeError::call("no call in progress")),
            Call::Incoming { session, .. } => {
                let session = session.clone();
                self.reject_call(&session)
            }
            _ => {
                self.end_call("hung up".to_string()).await;
                Ok(())
            }
        }
    }

    async fn end_call_in(&mut self, name: &SessionName, reason: &str) {
        if self.call.session().is_some_and(|(session, _)| session == name) {
            self.end_call(reason.to_string()).await;
        }
    }

    async fn end_call(&mut self, reason: String) {
        let call = mem::replace(&mut self.call, Call::Idle);
        let Some((session, peer)) = call.session().map(|(s, p)| (s.clone(), p)) else {
            return;
        };
        if let Call::Live { stream, .. } = &call {
            stream.stop();
        }
        self.emit(NodeEvent::CallEnded {
            session,
            peer,
            reason,
        })
        .await;
    }

    fn start_stream(
        &self,
        id: u64,
        peer: PeerId,
        host: String,
        ports: MediaPorts,
        listeners: MediaListeners,
    ) -> NodeResult<MediaStreamSession> {
        let commands = self.commands_tx.clone();
        MediaStreamSession::start(
            MediaPeer {
                id: peer,
                host,
                ports,
            },
            listeners,
            self.media.as_ref(),
            self.config.media.clone(),
            self.config.connect_retry_interval,
            move |reason| {
                tokio::spawn(async move {
                    let _ = commands
                        .send(ManagerCommand::CallFinished {
                            call_id: id,
                            reason,
                        })
                        .await;
                });
            },
        )
    }

    /// Sends call signalling in the background; a failed send ends the call.
    fn signal(&self, call_id: u64, session: ChatSession, message_type: MessageType, payload: String) {
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = session.send_control(message_type, &payload).await {
                warn!(session = %session.name(), error = %e, "Call signalling failed");
                let _ = commands
                    .send(ManagerCommand::CallFinished {
                        call_id,
                        reason: e.to_string(),
                    })
                    .await;
            }
        });
    }

    async fn peer_host(&self, peer: PeerId) -> NodeResult<String> {
        self.peers
            .resolve(peer)
            .await?
            .map(|peer| peer.address.host)
            .ok_or(NodeError::UnknownPeer(peer))
    }

    fn next_call(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }

    async fn emit(&self, event: NodeEvent) {
        debug!(?event, "Node event");
        if self.output.send(event).await.is_err() {
            debug!("Event receiver gone");
        }
    }
}

fn spawn_attach(session: ChatSession, peer: PeerId, stream: TcpStream) {
    tokio::spawn(async move {
        session.attach(peer, stream, peer).await;
    });
}

/// Cloneable handle to the manager task.
#[derive(Clone, Debug)]
pub struct SessionManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
}

impl SessionManagerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
    ) -> NodeResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| NodeError::ManagerStopped)?;
        rx.await.map_err(|_| NodeError::ManagerStopped)
    }

    /// Opens (or returns) the private session with `peer` and dials it.
    pub async fn open_private(&self, peer: PeerId) -> NodeResult<ChatSession> {
        self.request(|reply| ManagerCommand::OpenPrivate { peer, reply })
            .await?
    }

    /// Opens (or returns) a group session led by us.
    pub async fn open_group(&self, peers: Vec<PeerId>) -> NodeResult<ChatSession> {
        self.request(|reply| ManagerCommand::OpenGroup { peers, reply })
            .await?
    }

    /// Hands over an accepted connection and its first envelope.
    pub async fn route_inbound(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        envelope: Envelope,
    ) -> NodeResult<()> {
        self.tx
            .send(ManagerCommand::Inbound {
                stream,
                remote,
                envelope,
            })
            .await
            .map_err(|_| NodeError::ManagerStopped)
    }

    pub async fn session(&self, name: SessionName) -> NodeResult<Option<ChatSession>> {
        self.request(|reply| ManagerCommand::Session { name, reply })
            .await
    }

    /// Every live session, ordered by name.
    pub async fn sessions(&self) -> NodeResult<Vec<ChatSession>> {
        self.request(|reply| ManagerCommand::List { reply }).await
    }

    /// Deletes a session; returns once its peers were told.
    pub async fn remove(&self, name: SessionName) -> NodeResult<()> {
        self.request(|reply| ManagerCommand::Remove { name, reply })
            .await?
    }

    pub async fn request_call(&self, name: SessionName) -> NodeResult<()> {
        self.request(|reply| ManagerCommand::RequestCall { name, reply })
            .await?
    }

    pub async fn accept_call(&self, name: SessionName) -> NodeResult<()> {
        self.request(|reply| ManagerCommand::AcceptCall { name, reply })
            .await?
    }

    pub async fn reject_call(&self, name: SessionName) -> NodeResult<()> {
        self.request(|reply| ManagerCommand::RejectCall { name, reply })
            .await?
    }

    pub async fn hang_up(&self) -> NodeResult<()> {
        self.request(|reply| ManagerCommand::HangUp { reply }).await?
    }

    /// Logs out of every session and stops the manager.
    pub async fn shutdown(&self) -> NodeResult<()> {
        self.request(|reply| ManagerCommand::Shutdown { reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::MediaKind;
    use tokio::net::TcpListener;

    use crate::media::{MediaSink, MediaSource};
    use crate::wire::{read_envelope, write_envelope};

    const WAIT: Duration = Duration::from_secs(5);

    struct NoMedia;

    impl MediaBackend for NoMedia {
        fn source(&self, _kind: MediaKind) -> NodeResult<Box<dyn MediaSource>> {
            Err(NodeError::call("no media devices"))
        }

        fn sink(&self, _kind: MediaKind, _peer: PeerId) -> NodeResult<Box<dyn MediaSink>> {
            Err(NodeError::call("no media devices"))
        }
    }

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    struct Running {
        handle: SessionManagerHandle,
        events: mpsc::Receiver<NodeEvent>,
        shutdown: ShutdownHandle,
        _dir: tempfile::TempDir,
    }

    fn start(me: &str) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::new(id(me))
            .with_download_dir(dir.path())
            .with_activation_timeout(Duration::from_millis(300))
            .with_pending_link_ttl(Duration::from_millis(200));
        let (output, events) = mpsc::channel(64);
        let manager = SessionManager::new(
            Arc::new(config),
            2333,
            Arc::new(PeerBook::new()),
            Arc::new(NoMedia),
            output,
        );
        let handle = manager.handle();
        let shutdown = ShutdownHandle::new();
        tokio::spawn(manager.run(shutdown.clone()));
        Running {
            handle,
            events,
            shutdown,
            _dir: dir,
        }
    }

    /// Returns (our end, the end handed to the manager).
    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, remote) = server.unwrap();
        (client.unwrap(), server, remote)
    }

    async fn next_event(events: &mut mpsc::Receiver<NodeEvent>) -> NodeEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn open_validates_participants() {
        let node = start("1111111111");
        let err = node.handle.open_private(id("1111111111")).await.unwrap_err();
        assert!(matches!(err, NodeError::Id(_)));

        let err = node
            .handle
            .open_group(vec![id("2222222222")])
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Config { .. }));

        let err = node.handle.hang_up().await.unwrap_err();
        assert!(matches!(err, NodeError::Call { .. }));
        node.shutdown.trigger();
    }

    #[tokio::test]
    async fn inbound_private_request_creates_the_session() {
        let mut node = start("2222222222");
        let name = SessionName::private(id("1111111111"), id("2222222222")).unwrap();
        let (mut ours, theirs, remote) = socket_pair().await;

        let request = Envelope::control(
            name.as_str(),
            4444,
            MessageType::PrivateRequest,
            id("1111111111"),
            "",
        );
        node.handle.route_inbound(theirs, remote, request).await.unwrap();

        assert_eq!(
            next_event(&mut node.events).await,
            NodeEvent::SessionOpened {
                session: name.clone(),
                initiator: id("1111111111"),
            }
        );
        assert_eq!(
            next_event(&mut node.events).await,
            NodeEvent::SessionActive {
                session: name.clone()
            }
        );

        let text = Envelope::text(name.as_str(), 4444, id("1111111111"), "hello_world");
        write_envelope(&mut ours, &text).await.unwrap();
        match next_event(&mut node.events).await {
            NodeEvent::Message(message) => assert_eq!(message.text_content(), "hello_world"),
            other => panic!("unexpected event {other:?}"),
        }

        let sessions = node.handle.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name(), &name);
        node.shutdown.trigger();
    }

    #[tokio::test]
    async fn reopening_a_dropped_private_chat_redials() {
        let mut node = start("2222222222");
        let name = SessionName::private(id("1111111111"), id("2222222222")).unwrap();
        let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer_listener.local_addr().unwrap().port();
        let (ours, theirs, remote) = socket_pair().await;

        let request = Envelope::control(
            name.as_str(),
            peer_port,
            MessageType::PrivateRequest,
            id("1111111111"),
            "",
        );
        node.handle.route_inbound(theirs, remote, request).await.unwrap();
        loop {
            if matches!(next_event(&mut node.events).await, NodeEvent::SessionActive { .. }) {
                break;
            }
        }

        drop(ours);
        loop {
            if matches!(next_event(&mut node.events).await, NodeEvent::LinkLost { .. }) {
                break;
            }
        }
        let session = node.handle.session(name.clone()).await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Pending);

        node.handle.open_private(id("1111111111")).await.unwrap();
        let (mut redialed, _) = tokio::time::timeout(WAIT, peer_listener.accept())
            .await
            .unwrap()
            .unwrap();
        let handshake = read_envelope(&mut redialed).await.unwrap().unwrap().unwrap();
        assert_eq!(handshake.message_type, MessageType::PrivateRequest);
        assert_eq!(handshake.sender, id("2222222222"));

        session.wait_active(WAIT).await.unwrap();
        let sent = session.send_text("back again").await.unwrap();
        assert_eq!(sent.text_content(), "back again");
        let frame = read_envelope(&mut redialed).await.unwrap().unwrap().unwrap();
        assert_eq!(frame.payload, "back again");
        node.shutdown.trigger();
    }

    #[tokio::test]
    async fn foreign_sessions_are_refused() {
        let node = start("3333333333");
        let name = SessionName::private(id("1111111111"), id("2222222222")).unwrap();
        let (_ours, theirs, remote) = socket_pair().await;
        let request = Envelope::control(
            name.as_str(),
            4444,
            MessageType::PrivateRequest,
            id("1111111111"),
            "",
        );
        node.handle.route_inbound(theirs, remote, request).await.unwrap();
        assert!(node.handle.sessions().await.unwrap().is_empty());
        node.shutdown.trigger();
    }

    #[tokio::test]
    async fn parked_group_links_are_adopted() {
        // Leader 1111111111; 2222222222 dials us before the leader's request.
        let mut node = start("3333333333");
        let name =
            SessionName::from_ids([id("1111111111"), id("2222222222"), id("3333333333")]).unwrap();

        let (_from_b, theirs, remote) = socket_pair().await;
        let response = Envelope::control(
            name.as_str(),
            5555,
            MessageType::GroupResponse,
            id("2222222222"),
            "",
        );
        node.handle.route_inbound(theirs, remote, response).await.unwrap();
        assert!(node.handle.session(name.clone()).await.unwrap().is_none());

        let (_from_a, theirs, remote) = socket_pair().await;
        let request = Envelope::control(
            name.as_str(),
            4444,
            MessageType::GroupRequest,
            id("1111111111"),
            "",
        );
        node.handle.route_inbound(theirs, remote, request).await.unwrap();

        assert!(matches!(
            next_event(&mut node.events).await,
            NodeEvent::SessionOpened { initiator, .. } if initiator == id("1111111111")
        ));
        assert_eq!(
            next_event(&mut node.events).await,
            NodeEvent::SessionActive { session: name }
        );
        node.shutdown.trigger();
    }

    #[tokio::test]
    async fn stale_parked_links_are_dropped() {
        let node = start("3333333333");
        let name =
            SessionName::from_ids([id("1111111111"), id("2222222222"), id("3333333333")]).unwrap();
        let (mut from_b, theirs, remote) = socket_pair().await;
        let response = Envelope::control(
            name.as_str(),
            5555,
            MessageType::GroupResponse,
            id("2222222222"),
            "",
        );
        node.handle.route_inbound(theirs, remote, response).await.unwrap();

        // The manager drops its end once the link goes stale.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, tokio::io::AsyncReadExt::read(&mut from_b, &mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        node.shutdown.trigger();
    }

    #[tokio::test]
    async fn remove_reports_and_forgets_the_session() {
        let mut node = start("2222222222");
        let name = SessionName::private(id("1111111111"), id("2222222222")).unwrap();
        let (_ours, theirs, remote) = socket_pair().await;
        let request = Envelope::control(
            name.as_str(),
            4444,
            MessageType::PrivateRequest,
            id("1111111111"),
            "",
        );
        node.handle.route_inbound(theirs, remote, request).await.unwrap();
        next_event(&mut node.events).await;

        node.handle.remove(name.clone()).await.unwrap();
        loop {
            if let NodeEvent::SessionEnded { session, reason, .. } = next_event(&mut node.events).await {
                assert_eq!(session, name);
                assert_eq!(reason, "deleted");
                break;
            }
        }
        assert!(node.handle.session(name.clone()).await.unwrap().is_none());
        assert!(matches!(
            node.handle.remove(name).await,
            Err(NodeError::SessionNotFound(_))
        ));
        node.shutdown.trigger();
    }

    #[tokio::test]
    async fn handle_fails_once_the_manager_stopped() {
        let node = start("1111111111");
        node.handle.shutdown().await.unwrap();
        assert!(matches!(
            node.handle.sessions().await,
            Err(NodeError::ManagerStopped)
        ));
    }
}
