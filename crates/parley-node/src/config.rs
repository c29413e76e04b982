//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use parley_core::{PeerAddress, PeerId};
use parley_protocol::MediaPorts;
use parley_protocol::directory::{DEFAULT_CREDENTIAL, DEFAULT_LISTEN_PORT};

use crate::error::{NodeError, NodeResult};

/// Default directory port of the development directory server.
pub const DEFAULT_DIRECTORY_PORT: u16 = 10000;

/// Default raw transfer chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Media call settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaConfig {
    /// Port the video receiver listens on (0 picks a free port).
    pub video_port: u16,
    /// Port the audio receiver listens on (0 picks a free port).
    pub audio_port: u16,
    /// Video frames per second the rate controller aims for.
    pub target_frequency: f64,
    /// Smallest resize ratio the rate controller may choose.
    pub worst_ratio: f64,
    /// Frames between two rate controller adjustments.
    pub update_window: u32,
    /// Pause after each captured video frame.
    pub frame_interval: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_port: 2335,
            audio_port: 2334,
            target_frequency: 10.0,
            worst_ratio: 0.5,
            update_window: 1000,
            frame_interval: Duration::from_millis(50),
        }
    }
}

impl MediaConfig {
    /// The well-known ports, used when a peer does not announce its own.
    pub fn ports(&self) -> MediaPorts {
        MediaPorts::new(self.video_port, self.audio_port)
    }

    /// Builder: set both receiver ports.
    pub fn with_ports(mut self, video: u16, audio: u16) -> Self {
        self.video_port = video;
        self.audio_port = audio;
        self
    }

    /// Builder: set the rate controller parameters.
    pub fn with_rate_control(mut self, target_frequency: f64, worst_ratio: f64, window: u32) -> Self {
        self.target_frequency = target_frequency;
        self.worst_ratio = worst_ratio;
        self.update_window = window;
        self
    }

    /// Builder: set the pause between video frames.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }
}

/// Node configuration.
///
/// Built once at startup and shared read-only by every component.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Our identity.
    pub peer_id: PeerId,

    /// Address the peer listener binds to.
    pub bind_host: String,

    /// Port the peer listener binds to (0 picks a free port).
    pub listen_port: u16,

    /// Directory service address.
    pub directory: PeerAddress,

    /// Credential sent when registering.
    pub credential: String,

    /// Raw transfer chunk size.
    pub max_chunk_size: usize,

    /// Delay between refused connection attempts.
    pub connect_retry_interval: Duration,

    /// How long an inbound connection may take to send its first frame.
    pub connection_timeout: Duration,

    /// How long a send waits for a pending session to become active.
    pub activation_timeout: Duration,

    /// Maximum concurrent inbound handshakes.
    pub max_connections: usize,

    /// How long a group link is kept while its session does not exist yet.
    pub pending_link_ttl: Duration,

    /// How often known peers are looked up in the directory. Zero disables
    /// the refresh.
    pub presence_interval: Duration,

    /// Root directory for received images (`imgs/`) and files (`files/`).
    pub download_dir: PathBuf,

    /// Accept incoming calls without asking.
    pub auto_accept_calls: bool,

    /// Media call settings.
    pub media: MediaConfig,
}

impl NodeConfig {
    /// Creates a configuration with defaults for the given identity.
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            bind_host: "0.0.0.0".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            directory: PeerAddress::new("127.0.0.1", DEFAULT_DIRECTORY_PORT),
            credential: DEFAULT_CREDENTIAL.to_string(),
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            connect_retry_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(30),
            activation_timeout: Duration::from_secs(30),
            max_connections: 100,
            pending_link_ttl: Duration::from_secs(30),
            presence_interval: Duration::from_secs(5),
            download_dir: PathBuf::from("./receive"),
            auto_accept_calls: false,
            media: MediaConfig::default(),
        }
    }

    /// Builder: set bind host.
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Builder: set listen port.
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Builder: set directory address.
    pub fn with_directory(mut self, directory: PeerAddress) -> Self {
        self.directory = directory;
        self
    }

    /// Builder: set credential.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    /// Builder: set transfer chunk size.
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Builder: set connect retry interval.
    pub fn with_connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry_interval = interval;
        self
    }

    /// Builder: set connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Builder: set activation timeout.
    pub fn with_activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = timeout;
        self
    }

    /// Builder: set max concurrent handshakes.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set how long early group links are parked.
    pub fn with_pending_link_ttl(mut self, ttl: Duration) -> Self {
        self.pending_link_ttl = ttl;
        self
    }

    /// Builder: set the presence refresh period.
    pub fn with_presence_interval(mut self, interval: Duration) -> Self {
        self.presence_interval = interval;
        self
    }

    /// Builder: set download directory.
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Builder: accept calls automatically.
    pub fn with_auto_accept_calls(mut self, auto: bool) -> Self {
        self.auto_accept_calls = auto;
        self
    }

    /// Builder: set media settings.
    pub fn with_media(mut self, media: MediaConfig) -> Self {
        self.media = media;
        self
    }

    /// Where received images are written.
    pub fn images_dir(&self) -> PathBuf {
        self.download_dir.join("imgs")
    }

    /// Where received files are written.
    pub fn files_dir(&self) -> PathBuf {
        self.download_dir.join("files")
    }

    /// Checks values that would make the node misbehave.
    pub fn validate(&self) -> NodeResult<()> {
        if self.max_chunk_size == 0 {
            return Err(NodeError::config("max_chunk_size must be positive"));
        }
        if self.max_connections == 0 {
            return Err(NodeError::config("max_connections must be positive"));
        }
        if self.connect_retry_interval.is_zero() {
            return Err(NodeError::config("connect_retry_interval must be positive"));
        }
        if self.credential.is_empty() || self.credential.contains('_') {
            return Err(NodeError::config(
                "credential must be non-empty and must not contain '_'",
            ));
        }
        let media = &self.media;
        if !(media.target_frequency > 0.0) {
            return Err(NodeError::config("media target_frequency must be positive"));
        }
        if !(media.worst_ratio > 0.0 && media.worst_ratio <= 1.0) {
            return Err(NodeError::config("media worst_ratio must be in (0, 1]"));
        }
        if media.update_window == 0 {
            return Err(NodeError::config("media update_window must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> PeerId {
        "1111111111".parse().unwrap()
    }

    #[test]
    fn default_config() {
        let config = NodeConfig::new(id());
        assert_eq!(config.listen_port, 2333);
        assert_eq!(config.directory, PeerAddress::new("127.0.0.1", 10000));
        assert_eq!(config.credential, "net2019");
        assert_eq!(config.max_chunk_size, 1024);
        assert_eq!(config.connect_retry_interval, Duration::from_secs(1));
        assert_eq!(config.activation_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.presence_interval, Duration::from_secs(5));
        assert!(!config.auto_accept_calls);
        assert_eq!(config.images_dir(), PathBuf::from("./receive/imgs"));
        assert_eq!(config.files_dir(), PathBuf::from("./receive/files"));

        let media = &config.media;
        assert_eq!(media.ports(), MediaPorts::new(2335, 2334));
        assert_eq!(media.target_frequency, 10.0);
        assert_eq!(media.worst_ratio, 0.5);
        assert_eq!(media.update_window, 1000);
        assert_eq!(media.frame_interval, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn custom_config() {
        let config = NodeConfig::new(id())
            .with_bind_host("127.0.0.1")
            .with_listen_port(0)
            .with_directory(PeerAddress::new("10.0.0.1", 9000))
            .with_credential("secret")
            .with_max_chunk_size(64)
            .with_connect_retry_interval(Duration::from_millis(20))
            .with_activation_timeout(Duration::from_secs(5))
            .with_pending_link_ttl(Duration::from_secs(2))
            .with_presence_interval(Duration::ZERO)
            .with_download_dir("/tmp/parley")
            .with_auto_accept_calls(true)
            .with_media(MediaConfig::default().with_ports(0, 0).with_rate_control(25.0, 0.25, 50));

        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.max_chunk_size, 64);
        assert_eq!(config.pending_link_ttl, Duration::from_secs(2));
        assert!(config.presence_interval.is_zero());
        assert_eq!(config.images_dir(), PathBuf::from("/tmp/parley/imgs"));
        assert!(config.auto_accept_calls);
        assert_eq!(config.media.ports(), MediaPorts::new(0, 0));
        assert_eq!(config.media.update_window, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_nonsense() {
        assert!(NodeConfig::new(id()).with_max_chunk_size(0).validate().is_err());
        assert!(NodeConfig::new(id()).with_credential("a_b").validate().is_err());
        assert!(NodeConfig::new(id()).with_credential("").validate().is_err());
        let media = MediaConfig::default().with_rate_control(10.0, 1.5, 10);
        assert!(NodeConfig::new(id()).with_media(media).validate().is_err());
        let media = MediaConfig::default().with_rate_control(0.0, 0.5, 10);
        assert!(NodeConfig::new(id()).with_media(media).validate().is_err());
    }
}
