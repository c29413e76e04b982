//! Media sample codec.
//!
//! Each media frame carries one sample with a fixed 16-byte header:
//!
//! ```text
//! +---------+------+---------------+-----------------+--------------------+------+
//! | version | kind | sequence (BE) | capture_ms (BE) | scale_permille(BE) | data |
//! |   u8    |  u8  |      u32      |       u64       |        u16         |      |
//! +---------+------+---------------+-----------------+--------------------+------+
//! ```
//!
//! `data` is opaque here: whatever the capture device produced after the
//! sender applied `scale_permille / 1000` as its resize ratio.

use crate::error::{ProtocolError, ProtocolResult};

/// Current media sample layout version.
pub const MEDIA_FORMAT_VERSION: u8 = 2;

/// Size of the fixed sample header.
pub const MEDIA_HEADER_LEN: usize = 16;

/// Which media channel a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaKind {
    Video = 1,
    Audio = 2,
}

impl MediaKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl TryFrom<u8> for MediaKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Video),
            2 => Ok(Self::Audio),
            other => Err(ProtocolError::UnknownMediaKind(other)),
        }
    }
}

/// One captured audio chunk or video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    pub kind: MediaKind,
    /// Per-channel counter, starting at 0.
    pub sequence: u32,
    /// Capture time in milliseconds since the start of the call.
    pub capture_ms: u64,
    /// Resize ratio applied before encoding, in thousandths.
    pub scale_permille: u16,
    pub data: Vec<u8>,
}

impl MediaSample {
    /// A full-scale sample.
    pub fn new(kind: MediaKind, sequence: u32, capture_ms: u64, data: Vec<u8>) -> Self {
        Self {
            kind,
            sequence,
            capture_ms,
            scale_permille: 1000,
            data,
        }
    }

    /// Records the resize ratio the data was produced with.
    #[must_use]
    pub fn with_scale(mut self, ratio: f64) -> Self {
        self.scale_permille = (ratio.clamp(0.0, 1.0) * 1000.0).round() as u16;
        self
    }

    pub fn scale(&self) -> f64 {
        f64::from(self.scale_permille) / 1000.0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(MEDIA_HEADER_LEN + self.data.len());
        buffer.push(MEDIA_FORMAT_VERSION);
        buffer.push(self.kind as u8);
        buffer.extend_from_slice(&self.sequence.to_be_bytes());
        buffer.extend_from_slice(&self.capture_ms.to_be_bytes());
        buffer.extend_from_slice(&self.scale_permille.to_be_bytes());
        buffer.extend_from_slice(&self.data);
        buffer
    }

    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let Some((header, data)) = bytes.split_first_chunk::<MEDIA_HEADER_LEN>() else {
            return Err(ProtocolError::IncompleteMessage {
                expected: MEDIA_HEADER_LEN,
                received: bytes.len(),
            });
        };
        if header[0] != MEDIA_FORMAT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(header[0]));
        }
        let kind = MediaKind::try_from(header[1])?;
        let sequence = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        let mut capture = [0u8; 8];
        capture.copy_from_slice(&header[6..14]);
        let scale_permille = u16::from_be_bytes([header[14], header[15]]);

        Ok(Self {
            kind,
            sequence,
            capture_ms: u64::from_be_bytes(capture),
            scale_permille,
            data: data.to_vec(),
        })
    }
}
