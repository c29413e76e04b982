//! Call signalling payloads.
//!
//! A `VideoRequest` payload is empty or `:<video_port>:<audio_port>`. A
//! `VideoResponse` payload starts with `y` (agree) or `n` (reject); an
//! agreeing answer may carry the same port suffix. Without ports the
//! receiver falls back to its configured well-known media ports.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, ProtocolResult};

/// Ports a peer accepts media connections on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPorts {
    pub video: u16,
    pub audio: u16,
}

impl MediaPorts {
    pub fn new(video: u16, audio: u16) -> Self {
        Self { video, audio }
    }
}

impl fmt::Display for MediaPorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}:{}", self.video, self.audio)
    }
}

impl FromStr for MediaPorts {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::malformed(format!("bad media ports {s:?}"));
        let rest = s.strip_prefix(':').ok_or_else(malformed)?;
        let (video, audio) = rest.split_once(':').ok_or_else(malformed)?;
        Ok(Self {
            video: video.parse().map_err(|_| malformed())?,
            audio: audio.parse().map_err(|_| malformed())?,
        })
    }
}

/// Payload of a `VideoRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOffer {
    pub ports: Option<MediaPorts>,
}

impl CallOffer {
    pub fn new(ports: MediaPorts) -> Self {
        Self { ports: Some(ports) }
    }

    pub fn encode(&self) -> String {
        self.ports.map(|p| p.to_string()).unwrap_or_default()
    }

    /// Parses a request payload. Unparseable ports fall back to the defaults.
    pub fn parse(payload: &str) -> Self {
        Self {
            ports: payload.parse().ok(),
        }
    }

    pub fn ports_or(&self, defaults: MediaPorts) -> MediaPorts {
        self.ports.unwrap_or(defaults)
    }
}

/// Payload of a `VideoResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAnswer {
    Accept(Option<MediaPorts>),
    Reject,
}

impl CallAnswer {
    pub fn encode(&self) -> String {
        match self {
            Self::Accept(Some(ports)) => format!("y{ports}"),
            Self::Accept(None) => "y".to_string(),
            Self::Reject => "n".to_string(),
        }
    }

    pub fn parse(payload: &str) -> ProtocolResult<Self> {
        if let Some(rest) = payload.strip_prefix('y') {
            return Ok(Self::Accept(rest.parse().ok()));
        }
        if payload.starts_with('n') {
            return Ok(Self::Reject);
        }
        Err(ProtocolError::malformed(format!(
            "call answer must start with y or n: {payload:?}"
        )))
    }
}
