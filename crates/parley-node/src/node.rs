//! Node orchestrator.
//!
//! Wires the peer listener, the session manager and the address book
//! together and exposes the operations a front end needs. Events for the
//! user arrive on the receiver returned by [`Node::start`].

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parley_core::{DeliveredMessage, PeerId, SessionName};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::directory::{PeerBook, PeerResolver};
use crate::error::{NodeError, NodeResult};
use crate::event::{NodeEvent, SessionInfo};
use crate::listener::PeerListener;
use crate::manager::{SessionManager, SessionManagerHandle};
use crate::media::MediaBackend;
use crate::session::ChatSession;
use crate::signals::ShutdownHandle;

const EVENT_BUFFER: usize = 256;

/// A running peer.
pub struct Node {
    config: Arc<NodeConfig>,
    local_addr: SocketAddr,
    peers: Arc<PeerBook>,
    manager: SessionManagerHandle,
    shutdown: ShutdownHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Binds the listener and starts the manager.
    pub async fn start(
        config: NodeConfig,
        peers: Arc<PeerBook>,
        media: Arc<dyn MediaBackend>,
    ) -> NodeResult<(Self, mpsc::Receiver<NodeEvent>)> {
        config.validate()?;
        let config = Arc::new(config);
        let listener = PeerListener::bind(config.clone()).await?;
        let local_addr = listener.local_addr()?;

        let (output, events) = mpsc::channel(EVENT_BUFFER);
        let manager = SessionManager::new(
            config.clone(),
            local_addr.port(),
            peers.clone(),
            media,
            output.clone(),
        );
        let handle = manager.handle();
        let shutdown = ShutdownHandle::new();
        let mut tasks = vec![
            tokio::spawn(manager.run(shutdown.clone())),
            tokio::spawn(listener.run_until_shutdown(handle.clone(), shutdown.clone())),
        ];
        if !config.presence_interval.is_zero() && peers.has_directory().await {
            tasks.push(tokio::spawn(watch_presence(
                peers.clone(),
                config.presence_interval,
                output,
                shutdown.clone(),
            )));
        }
        info!(peer = %config.peer_id, address = %local_addr, "Node started");

        let node = Self {
            config,
            local_addr,
            peers,
            manager: handle,
            shutdown,
            tasks,
        };
        Ok((node, events))
    }

    pub fn id(&self) -> PeerId {
        self.config.peer_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &Arc<PeerBook> {
        &self.peers
    }

    /// Announces our listen port to the directory.
    pub async fn register(&self) -> NodeResult<()> {
        self.peers
            .register(self.id(), &self.config.credential, self.local_addr.port())
            .await?;
        info!(peer = %self.id(), port = self.local_addr.port(), "Registered with directory");
        Ok(())
    }

    /// Opens the private chat with `peer`.
    pub async fn open_private(&self, peer: PeerId) -> NodeResult<SessionName> {
        self.ensure_known(peer).await?;
        let session = self.manager.open_private(peer).await?;
        Ok(session.name().clone())
    }

    /// Opens a group chat led by us with `peers`.
    pub async fn open_group(&self, peers: Vec<PeerId>) -> NodeResult<SessionName> {
        for &peer in &peers {
            if peer != self.id() {
                self.ensure_known(peer).await?;
            }
        }
        let session = self.manager.open_group(peers).await?;
        Ok(session.name().clone())
    }

    async fn ensure_known(&self, peer: PeerId) -> NodeResult<()> {
        match self.peers.resolve(peer).await? {
            Some(_) => Ok(()),
            None => Err(NodeError::UnknownPeer(peer)),
        }
    }

    async fn session(&self, name: &SessionName) -> NodeResult<ChatSession> {
        self.manager
            .session(name.clone())
            .await?
            .ok_or_else(|| NodeError::SessionNotFound(name.clone()))
    }

    pub async fn send_text(&self, name: &SessionName, text: &str) -> NodeResult<DeliveredMessage> {
        self.session(name).await?.send_text(text).await
    }

    pub async fn send_image(&self, name: &SessionName, path: &Path) -> NodeResult<DeliveredMessage> {
        self.session(name).await?.send_image(path).await
    }

    pub async fn send_file(&self, name: &SessionName, path: &Path) -> NodeResult<DeliveredMessage> {
        self.session(name).await?.send_file(path).await
    }

    /// Waits until every link of the session is up.
    pub async fn wait_active(&self, name: &SessionName, timeout: Duration) -> NodeResult<()> {
        self.session(name).await?.wait_active(timeout).await
    }

    pub async fn history(&self, name: &SessionName) -> NodeResult<Vec<DeliveredMessage>> {
        Ok(self.session(name).await?.history())
    }

    /// Snapshots of every session.
    pub async fn sessions(&self) -> NodeResult<Vec<SessionInfo>> {
        let mut infos = Vec::new();
        for session in self.manager.sessions().await? {
            infos.push(SessionInfo::new(
                session.name().clone(),
                session.kind(),
                session.state(),
                session.peers(),
                session.linked_peers().await,
                session.history().len(),
            ));
        }
        Ok(infos)
    }

    /// Deletes a session and tells its peers.
    pub async fn delete_session(&self, name: &SessionName) -> NodeResult<()> {
        self.manager.remove(name.clone()).await
    }

    pub async fn request_call(&self, name: &SessionName) -> NodeResult<()> {
        self.manager.request_call(name.clone()).await
    }

    pub async fn accept_call(&self, name: &SessionName) -> NodeResult<()> {
        self.manager.accept_call(name.clone()).await
    }

    pub async fn reject_call(&self, name: &SessionName) -> NodeResult<()> {
        self.manager.reject_call(name.clone()).await
    }

    pub async fn hang_up(&self) -> NodeResult<()> {
        self.manager.hang_up().await
    }

    /// Returns a handle that stops the node when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Logs out of every session, deregisters and stops all tasks.
    pub async fn shutdown(self) {
        if let Err(e) = self.manager.shutdown().await {
            warn!(error = %e, "Session manager already stopped");
        }
        if let Err(e) = self.peers.deregister(self.id()).await {
            warn!(error = %e, "Failed to deregister from directory");
        }
        self.shutdown.trigger();
        for task in self.tasks {
            let _ = task.await;
        }
        info!(peer = %self.config.peer_id, "Node stopped");
    }
}

/// Refreshes the presence of known peers every `period`.
async fn watch_presence(
    peers: Arc<PeerBook>,
    period: Duration,
    output: mpsc::Sender<NodeEvent>,
    shutdown: ShutdownHandle,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(period = ?period, "Presence refresh started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let changes = tokio::select! {
            changes = peers.refresh_presence() => changes,
            _ = shutdown.cancelled() => return,
        };
        match changes {
            Ok(changes) => {
                for change in changes {
                    tokio::select! {
                        sent = output.send(NodeEvent::from(change)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
            Err(e) => warn!(error = %e, "Presence refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use parley_core::{ContentKind, Direction, Peer, PeerAddress};
    use parley_protocol::{MediaKind, MediaSample};

    use crate::config::MediaConfig;
    use crate::directory::DirectoryClient;
    use crate::directory_server::DirectoryServer;
    use crate::media::{MediaSink, MediaSource};

    const WAIT: Duration = Duration::from_secs(10);

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    struct Counter;

    #[async_trait]
    impl MediaSource for Counter {
        async fn capture(&mut self, scale: f64) -> NodeResult<Vec<u8>> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(vec![(scale * 100.0) as u8; 8])
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<usize>>);

    #[async_trait]
    impl MediaSink for Recorder {
        async fn render(&mut self, _sample: MediaSample) -> NodeResult<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestBackend {
        rendered: Recorder,
    }

    impl MediaBackend for TestBackend {
        fn source(&self, _kind: MediaKind) -> NodeResult<Box<dyn MediaSource>> {
            Ok(Box::new(Counter))
        }

        fn sink(&self, _kind: MediaKind, _peer: PeerId) -> NodeResult<Box<dyn MediaSink>> {
            Ok(Box::new(self.rendered.clone()))
        }
    }

    struct TestNode {
        node: Node,
        events: mpsc::Receiver<NodeEvent>,
        _dir: tempfile::TempDir,
    }

    impl TestNode {
        async fn start(me: &str, peers: Arc<PeerBook>) -> Self {
            Self::start_with(me, peers, |config| config).await
        }

        async fn start_with(
            me: &str,
            peers: Arc<PeerBook>,
            tweak: impl FnOnce(NodeConfig) -> NodeConfig,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = NodeConfig::new(id(me))
                .with_bind_host("127.0.0.1")
                .with_listen_port(0)
                .with_download_dir(dir.path())
                .with_max_chunk_size(16)
                .with_connect_retry_interval(Duration::from_millis(50))
                .with_activation_timeout(Duration::from_secs(5))
                .with_media(
                    MediaConfig::default()
                        .with_ports(0, 0)
                        .with_frame_interval(Duration::from_millis(5)),
                );
            let (node, events) = Node::start(tweak(config), peers, Arc::new(TestBackend::default()))
                .await
                .unwrap();
            Self {
                node,
                events,
                _dir: dir,
            }
        }

        fn peer(&self) -> Peer {
            Peer::new(
                self.node.id(),
                PeerAddress::new("127.0.0.1", self.node.local_addr().port()),
            )
        }

        async fn wait_for<F>(&mut self, mut wanted: F) -> NodeEvent
        where
            F: FnMut(&NodeEvent) -> bool,
        {
            let deadline = tokio::time::Instant::now() + WAIT;
            loop {
                let event = tokio::time::timeout_at(deadline, self.events.recv())
                    .await
                    .expect("timed out waiting for event")
                    .expect("event channel closed");
                if wanted(&event) {
                    return event;
                }
            }
        }

        async fn next_message(&mut self) -> DeliveredMessage {
            match self
                .wait_for(|e| matches!(e, NodeEvent::Message(m) if m.direction() == Direction::Received))
                .await
            {
                NodeEvent::Message(message) => message,
                _ => unreachable!(),
            }
        }

        async fn wait_active(&mut self, name: &SessionName) {
            self.wait_for(|e| matches!(e, NodeEvent::SessionActive { session } if session == name))
                .await;
        }
    }

    /// Starts nodes that know each other's addresses.
    async fn network(ids: &[&str]) -> Vec<TestNode> {
        let mut nodes = Vec::new();
        for me in ids {
            nodes.push(TestNode::start(me, Arc::new(PeerBook::new())).await);
        }
        for node in &nodes {
            for other in &nodes {
                if other.node.id() != node.node.id() {
                    node.node.peers().learn(other.peer());
                }
            }
        }
        nodes
    }

    #[tokio::test]
    async fn hello_world_private_chat() {
        let mut nodes = network(&["1111111111", "2222222222"]).await;
        let name = nodes[0].node.open_private(id("2222222222")).await.unwrap();
        assert_eq!(name.as_str(), "1111111111-2222222222");

        let sent = nodes[0].node.send_text(&name, "hello_world").await.unwrap();
        assert_eq!(sent.direction(), Direction::Sent);

        let received = nodes[1].next_message().await;
        assert_eq!(received.session(), &name);
        assert_eq!(received.sender(), id("1111111111"));
        assert_eq!(received.kind(), ContentKind::Text);
        assert_eq!(received.text_content(), "hello_world");
        assert_eq!(nodes[1].node.history(&name).await.unwrap(), vec![received]);

        for node in nodes {
            node.node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn simultaneous_opens_deliver_both_ways() {
        for _ in 0..5 {
            let mut nodes = network(&["1111111111", "2222222222"]).await;
            let (a, b) = (&nodes[0].node, &nodes[1].node);
            let (name_a, name_b) = tokio::join!(
                a.open_private(id("2222222222")),
                b.open_private(id("1111111111")),
            );
            let name = name_a.unwrap();
            assert_eq!(name_b.unwrap(), name);

            let (sent_a, sent_b) = tokio::join!(
                a.send_text(&name, "from a"),
                b.send_text(&name, "from b"),
            );
            sent_a.unwrap();
            sent_b.unwrap();
            assert_eq!(nodes[1].next_message().await.text_content(), "from a");
            assert_eq!(nodes[0].next_message().await.text_content(), "from b");

            // Whichever link won, it carries later traffic too.
            tokio::time::sleep(Duration::from_millis(50)).await;
            nodes[1].node.send_text(&name, "settled").await.unwrap();
            assert_eq!(nodes[0].next_message().await.text_content(), "settled");

            for node in nodes {
                node.node.shutdown().await;
            }
        }
    }

    #[tokio::test]
    async fn group_mesh_links_every_pair() {
        let ids = ["1111111111", "2222222222", "3333333333", "4444444444"];
        let mut nodes = network(&ids).await;
        // The leader is neither the smallest nor the largest id.
        let leader = 2;
        let others: Vec<PeerId> = ids
            .iter()
            .filter(|&&s| s != ids[leader])
            .map(|s| id(s))
            .collect();
        let name = nodes[leader].node.open_group(others).await.unwrap();

        for node in nodes.iter_mut() {
            node.wait_active(&name).await;
        }
        for node in &nodes {
            let infos = node.node.sessions().await.unwrap();
            assert_eq!(infos.len(), 1);
            assert_eq!(infos[0].state, "active");
            assert_eq!(infos[0].leader, Some(id(ids[leader])));
            assert_eq!(infos[0].linked.len(), 3);
        }

        nodes[0].node.send_text(&name, "from the smallest").await.unwrap();
        for node in nodes.iter_mut().skip(1) {
            let message = node.next_message().await;
            assert_eq!(message.sender(), id("1111111111"));
            assert_eq!(message.text_content(), "from the smallest");
        }

        for node in nodes {
            node.node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn concurrent_sends_do_not_interleave() {
        let mut nodes = network(&["1111111111", "2222222222"]).await;
        let name = nodes[0].node.open_private(id("2222222222")).await.unwrap();
        nodes[0].wait_active(&name).await;

        let src = tempfile::tempdir().unwrap();
        let big = src.path().join("big.bin");
        let small = src.path().join("small.txt");
        let big_bytes: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&big, &big_bytes).unwrap();
        std::fs::write(&small, b"tiny").unwrap();

        let sender = &nodes[0].node;
        let (a, b, c) = tokio::join!(
            sender.send_file(&name, &big),
            sender.send_text(&name, "in between"),
            sender.send_image(&name, &small),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(nodes[1].next_message().await);
        }
        let file = received.iter().find(|m| m.kind() == ContentKind::File).unwrap();
        assert_eq!(std::fs::read(file.path().unwrap()).unwrap(), big_bytes);
        let image = received.iter().find(|m| m.kind() == ContentKind::Image).unwrap();
        assert!(image.path().unwrap().ends_with("imgs/small.txt"));
        assert_eq!(std::fs::read(image.path().unwrap()).unwrap(), b"tiny");
        assert!(received.iter().any(|m| m.text_content() == "in between"));

        for node in nodes {
            node.node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn deleting_a_private_chat_ends_it_for_the_peer() {
        let mut nodes = network(&["1111111111", "2222222222"]).await;
        let name = nodes[0].node.open_private(id("2222222222")).await.unwrap();
        nodes[1].wait_active(&name).await;

        nodes[0].node.delete_session(&name).await.unwrap();
        let ended = nodes[1]
            .wait_for(|e| matches!(e, NodeEvent::SessionEnded { .. }))
            .await;
        assert_eq!(
            ended,
            NodeEvent::SessionEnded {
                session: name.clone(),
                peer: Some(id("1111111111")),
                reason: "deleted the chat".to_string(),
            }
        );
        assert!(nodes[1].node.sessions().await.unwrap().is_empty());
        assert!(matches!(
            nodes[1].node.send_text(&name, "anyone?").await,
            Err(NodeError::SessionNotFound(_))
        ));

        for node in nodes {
            node.node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn unknown_peers_are_refused() {
        let nodes = network(&["1111111111"]).await;
        assert!(matches!(
            nodes[0].node.open_private(id("9999999999")).await,
            Err(NodeError::UnknownPeer(_))
        ));
        for node in nodes {
            node.node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn peers_find_each_other_through_the_directory() {
        let server = DirectoryServer::bind("127.0.0.1:0", "net2019").await.unwrap();
        let directory = PeerAddress::from(server.local_addr().unwrap());
        let stop = ShutdownHandle::new();
        tokio::spawn(server.run_until_shutdown(stop.clone()));

        let book_a = PeerBook::with_directory(DirectoryClient::connect(&directory).await.unwrap());
        let book_b = PeerBook::with_directory(DirectoryClient::connect(&directory).await.unwrap());
        let a = TestNode::start("1111111111", Arc::new(book_a)).await;
        let mut b = TestNode::start("2222222222", Arc::new(book_b)).await;
        a.node.register().await.unwrap();
        b.node.register().await.unwrap();

        let name = a.node.open_private(id("2222222222")).await.unwrap();
        a.node.send_text(&name, "found you").await.unwrap();
        assert_eq!(b.next_message().await.text_content(), "found you");

        a.node.shutdown().await;
        b.node.shutdown().await;

        let mut client = DirectoryClient::connect(&directory).await.unwrap();
        assert_eq!(client.query(id("1111111111")).await.unwrap(), None);
        stop.trigger();
    }

    #[tokio::test]
    async fn presence_follows_directory_registrations() {
        let server = DirectoryServer::bind("127.0.0.1:0", "net2019").await.unwrap();
        let directory = PeerAddress::from(server.local_addr().unwrap());
        let stop = ShutdownHandle::new();
        tokio::spawn(server.run_until_shutdown(stop.clone()));
        let book = |directory: &PeerAddress| {
            let directory = directory.clone();
            async move {
                Arc::new(PeerBook::with_directory(
                    DirectoryClient::connect(&directory).await.unwrap(),
                ))
            }
        };
        let fast = |config: NodeConfig| config.with_presence_interval(Duration::from_millis(50));

        let mut a = TestNode::start_with("1111111111", book(&directory).await, fast).await;
        let b = TestNode::start("2222222222", book(&directory).await).await;
        a.node.register().await.unwrap();
        b.node.register().await.unwrap();
        let first = b.node.local_addr().port();
        assert_eq!(
            a.node.peers().resolve(id("2222222222")).await.unwrap().unwrap().address.port,
            first
        );

        b.node.shutdown().await;
        let offline = a
            .wait_for(|e| matches!(e, NodeEvent::PresenceChanged { .. }))
            .await;
        assert_eq!(
            offline,
            NodeEvent::PresenceChanged {
                peer: id("2222222222"),
                online: false,
                address: None,
            }
        );

        let b = TestNode::start("2222222222", book(&directory).await).await;
        b.node.register().await.unwrap();
        let online = a
            .wait_for(|e| matches!(e, NodeEvent::PresenceChanged { .. }))
            .await;
        let second = PeerAddress::new("127.0.0.1", b.node.local_addr().port());
        assert_eq!(
            online,
            NodeEvent::PresenceChanged {
                peer: id("2222222222"),
                online: true,
                address: Some(second.clone()),
            }
        );
        assert_eq!(a.node.peers().lookup(id("2222222222")).unwrap().address, second);

        a.node.shutdown().await;
        b.node.shutdown().await;
        stop.trigger();
    }

    #[tokio::test]
    async fn private_call_starts_and_hangs_up() {
        let mut nodes = network(&["1111111111", "2222222222"]).await;
        let name = nodes[0].node.open_private(id("2222222222")).await.unwrap();
        nodes[0].wait_active(&name).await;
        nodes[1].wait_active(&name).await;

        nodes[0].node.request_call(&name).await.unwrap();
        nodes[1]
            .wait_for(|e| matches!(e, NodeEvent::CallRequested { .. }))
            .await;
        nodes[1].node.accept_call(&name).await.unwrap();

        for node in nodes.iter_mut() {
            node.wait_for(|e| matches!(e, NodeEvent::CallStarted { .. }))
                .await;
        }
        // A second request while the call is live is refused locally.
        assert!(matches!(
            nodes[0].node.request_call(&name).await,
            Err(NodeError::Call { .. })
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        nodes[0].node.hang_up().await.unwrap();
        let ended = nodes[0]
            .wait_for(|e| matches!(e, NodeEvent::CallEnded { .. }))
            .await;
        assert!(matches!(ended, NodeEvent::CallEnded { reason, .. } if reason == "hung up"));
        nodes[1]
            .wait_for(|e| matches!(e, NodeEvent::CallEnded { .. }))
            .await;

        for node in nodes {
            node.node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn rejected_call_is_reported() {
        let mut nodes = network(&["1111111111", "2222222222"]).await;
        let name = nodes[0].node.open_private(id("2222222222")).await.unwrap();
        nodes[0].wait_active(&name).await;

        nodes[0].node.request_call(&name).await.unwrap();
        nodes[1]
            .wait_for(|e| matches!(e, NodeEvent::CallRequested { .. }))
            .await;
        nodes[1].node.reject_call(&name).await.unwrap();
        let rejected = nodes[0]
            .wait_for(|e| matches!(e, NodeEvent::CallRejected { .. }))
            .await;
        assert_eq!(
            rejected,
            NodeEvent::CallRejected {
                session: name,
                peer: id("2222222222"),
            }
        );

        for node in nodes {
            node.node.shutdown().await;
        }
    }
}
