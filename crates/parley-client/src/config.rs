//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/parley/config.toml` by default. Command-line flags and
//! `PARLEY_*` environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::{PeerAddress, PeerId};
use parley_node::{DEFAULT_CHUNK_SIZE, DEFAULT_DIRECTORY_PORT, MediaConfig, NodeConfig};
use parley_protocol::directory::{DEFAULT_CREDENTIAL, DEFAULT_LISTEN_PORT};
use serde::{Deserialize, Serialize};

use crate::cli::RunArgs;
use crate::error::{ClientError, ClientResult};

// ---------------------------------------------------------------------------
// ClientConfig (config.toml)
// ---------------------------------------------------------------------------

/// Configuration for the parley client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity and listener settings.
    pub node: NodeSettings,

    /// Directory service settings.
    pub directory: DirectorySettings,

    /// Connection and transfer tuning.
    pub transfer: TransferSettings,

    /// Media call settings.
    pub media: MediaSettings,
}

/// Identity and listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Our 10-digit peer id.
    pub id: Option<String>,

    /// Address to bind the peer listener to.
    pub bind_host: String,

    /// Port to accept peers on.
    pub port: u16,

    /// Where received images and files are stored.
    pub download_dir: Option<PathBuf>,

    /// Accept incoming calls without asking.
    pub auto_accept_calls: bool,

    /// Maximum number of handshakes in flight.
    pub max_connections: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: None,
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_LISTEN_PORT,
            download_dir: None,
            auto_accept_calls: false,
            max_connections: 100,
        }
    }
}

/// Directory service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// Register with and query the directory.
    pub enabled: bool,

    pub host: String,

    pub port: u16,

    /// Shared credential presented on registration.
    pub credential: String,

    /// Seconds between presence lookups of known peers; 0 turns them off.
    pub presence_interval_secs: u64,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_DIRECTORY_PORT,
            credential: DEFAULT_CREDENTIAL.to_string(),
            presence_interval_secs: 5,
        }
    }
}

impl DirectorySettings {
    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(self.host.clone(), self.port)
    }
}

/// Connection and transfer tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Largest raw chunk written at once, in bytes.
    pub max_chunk_size: usize,

    /// Pause between refused connection attempts, in milliseconds.
    pub connect_retry_ms: u64,

    /// Time allowed for a peer's handshake, in seconds.
    pub connection_timeout_secs: u64,

    /// Time a send waits for a pending session, in seconds.
    pub activation_timeout_secs: u64,

    /// Time a group link may wait for its session, in seconds.
    pub pending_link_ttl_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            connect_retry_ms: 1000,
            connection_timeout_secs: 30,
            activation_timeout_secs: 30,
            pending_link_ttl_secs: 30,
        }
    }
}

/// Media call settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    pub video_port: u16,
    pub audio_port: u16,

    /// Video frames per second to aim for.
    pub target_frequency: f64,

    /// Smallest resize ratio for video frames.
    pub worst_ratio: f64,

    /// Frames between two rate adjustments.
    pub update_window: u32,

    /// Pause after each video frame, in milliseconds.
    pub frame_interval_ms: u64,
}

impl Default for MediaSettings {
    fn default() -> Self {
        let media = MediaConfig::default();
        Self {
            video_port: media.video_port,
            audio_port: media.audio_port,
            target_frequency: media.target_frequency,
            worst_ratio: media.worst_ratio,
            update_window: media.update_window,
            frame_interval_ms: media.frame_interval.as_millis() as u64,
        }
    }
}

impl From<&MediaSettings> for MediaConfig {
    fn from(settings: &MediaSettings) -> Self {
        MediaConfig::default()
            .with_ports(settings.video_port, settings.audio_port)
            .with_rate_control(
                settings.target_frequency,
                settings.worst_ratio,
                settings.update_window,
            )
            .with_frame_interval(Duration::from_millis(settings.frame_interval_ms))
    }
}

impl ClientConfig {
    /// Loads configuration from the default path.
    pub fn load() -> Result<Self, String> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
    }

    /// Folds `parley run` flags into the file settings.
    pub fn apply(&mut self, args: &RunArgs) -> ClientResult<()> {
        if let Some(ref id) = args.id {
            self.node.id = Some(id.clone());
        }
        if let Some(port) = args.port {
            self.node.port = port;
        }
        if let Some(ref dir) = args.download_dir {
            self.node.download_dir = Some(dir.clone());
        }
        if args.auto_accept_calls {
            self.node.auto_accept_calls = true;
        }
        if let Some(ref credential) = args.credential {
            self.directory.credential = credential.clone();
        }
        if let Some(ref directory) = args.directory {
            let address = parse_address(directory)?;
            self.directory.host = address.host;
            self.directory.port = address.port;
        }
        if args.no_directory {
            self.directory.enabled = false;
        }
        Ok(())
    }

    /// Returns our peer id, which must be configured.
    pub fn peer_id(&self) -> ClientResult<PeerId> {
        let id = self.node.id.as_deref().ok_or_else(|| {
            ClientError::Config(format!(
                "no peer id configured. Pass --id or add to {}:\n  \
                 [node]\n  \
                 id = \"1234567890\"",
                Self::default_path().display()
            ))
        })?;
        id.parse()
            .map_err(|e| ClientError::Config(format!("invalid peer id: {}", e)))
    }

    /// Builds the node configuration.
    pub fn node_config(&self) -> ClientResult<NodeConfig> {
        let transfer = &self.transfer;
        let mut config = NodeConfig::new(self.peer_id()?)
            .with_bind_host(self.node.bind_host.clone())
            .with_listen_port(self.node.port)
            .with_directory(self.directory.address())
            .with_credential(self.directory.credential.clone())
            .with_max_chunk_size(transfer.max_chunk_size)
            .with_connect_retry_interval(Duration::from_millis(transfer.connect_retry_ms))
            .with_connection_timeout(Duration::from_secs(transfer.connection_timeout_secs))
            .with_activation_timeout(Duration::from_secs(transfer.activation_timeout_secs))
            .with_pending_link_ttl(Duration::from_secs(transfer.pending_link_ttl_secs))
            .with_presence_interval(Duration::from_secs(self.directory.presence_interval_secs))
            .with_max_connections(self.node.max_connections)
            .with_auto_accept_calls(self.node.auto_accept_calls)
            .with_media(MediaConfig::from(&self.media));
        if let Some(ref dir) = self.node.download_dir {
            config = config.with_download_dir(dir);
        }
        config
            .validate()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        Ok(config)
    }
}

/// Parses `HOST:PORT`; an IPv6 host is written in brackets.
pub fn parse_address(text: &str) -> ClientResult<PeerAddress> {
    let invalid = || ClientError::Config(format!("invalid address {:?}, expected HOST:PORT", text));
    let (host, port) = text.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse().map_err(|_| invalid())?;
    Ok(PeerAddress::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.node.port, 2333);
        assert_eq!(config.directory.credential, "net2019");
        assert_eq!(config.transfer.max_chunk_size, 1024);
        assert_eq!(config.media.frame_interval_ms, 50);
    }

    #[test]
    fn sections_map_onto_node_config() {
        let toml_content = r#"
[node]
id = "1111111111"
port = 9001
download_dir = "/tmp/parley"
auto_accept_calls = true

[directory]
host = "10.0.0.5"
port = 12000
credential = "secret"
presence_interval_secs = 0

[transfer]
max_chunk_size = 4096
connect_retry_ms = 250

[media]
video_port = 3335
audio_port = 3334
target_frequency = 15.0
"#;
        let config: ClientConfig = toml::from_str(toml_content).unwrap();
        let node = config.node_config().unwrap();
        assert_eq!(node.peer_id.as_str(), "1111111111");
        assert_eq!(node.listen_port, 9001);
        assert_eq!(node.download_dir, PathBuf::from("/tmp/parley"));
        assert!(node.auto_accept_calls);
        assert_eq!(node.directory, PeerAddress::new("10.0.0.5", 12000));
        assert_eq!(node.credential, "secret");
        assert!(node.presence_interval.is_zero());
        assert_eq!(node.max_chunk_size, 4096);
        assert_eq!(node.connect_retry_interval, Duration::from_millis(250));
        assert_eq!(node.media.video_port, 3335);
        assert_eq!(node.media.audio_port, 3334);
        assert_eq!(node.media.target_frequency, 15.0);
        assert_eq!(node.media.worst_ratio, 0.5);
    }

    #[test]
    fn flags_override_the_file() {
        let mut config: ClientConfig = toml::from_str("[node]\nid = \"1111111111\"\n").unwrap();
        let args = RunArgs {
            id: Some("2222222222".into()),
            port: Some(0),
            directory: Some("192.168.1.2:10001".into()),
            credential: Some("other".into()),
            ..RunArgs::default()
        };
        config.apply(&args).unwrap();
        let node = config.node_config().unwrap();
        assert_eq!(node.peer_id.as_str(), "2222222222");
        assert_eq!(node.listen_port, 0);
        assert_eq!(node.directory, PeerAddress::new("192.168.1.2", 10001));
        assert_eq!(node.credential, "other");
        assert!(config.directory.enabled);

        config
            .apply(&RunArgs {
                no_directory: true,
                ..RunArgs::default()
            })
            .unwrap();
        assert!(!config.directory.enabled);
    }

    #[test]
    fn missing_or_bad_id_is_a_config_error() {
        let config = ClientConfig::default();
        let err = config.node_config().unwrap_err();
        assert!(err.to_string().contains("no peer id configured"));

        let config: ClientConfig = toml::from_str("[node]\nid = \"12345\"\n").unwrap();
        assert!(matches!(config.node_config(), Err(ClientError::Config(_))));
    }

    #[test]
    fn credential_with_underscore_is_rejected() {
        let config: ClientConfig =
            toml::from_str("[node]\nid = \"1111111111\"\n[directory]\ncredential = \"a_b\"\n")
                .unwrap();
        let err = config.node_config().unwrap_err();
        assert!(err.to_string().contains("credential"));
    }

    #[test]
    fn addresses() {
        assert_eq!(
            parse_address("127.0.0.1:10000").unwrap(),
            PeerAddress::new("127.0.0.1", 10000)
        );
        assert_eq!(
            parse_address("[::1]:2333").unwrap(),
            PeerAddress::new("::1", 2333)
        );
        assert!(parse_address("localhost").is_err());
        assert!(parse_address(":80").is_err());
        assert!(parse_address("host:port").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[node]\nid = \"3333333333\"\n").unwrap();
        let config = ClientConfig::load_from(&path).unwrap();
        assert_eq!(config.node.id.as_deref(), Some("3333333333"));

        std::fs::write(&path, "[node\n").unwrap();
        assert!(ClientConfig::load_from(&path).unwrap_err().contains("parse"));
    }
}
