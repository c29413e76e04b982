//! Synthetic media devices.
//!
//! The terminal client has no camera, microphone or screen. Calls still run
//! end to end: video frames are generated test patterns whose size follows
//! the resize ratio, audio is silence in 20 ms chunks, and received samples
//! are counted and logged.

use std::time::Duration;

use async_trait::async_trait;
use parley_core::PeerId;
use parley_node::{MediaBackend, MediaSink, MediaSource, NodeResult};
use parley_protocol::{MediaKind, MediaSample};
use tracing::{debug, info};

/// Full-scale synthetic frame width.
const FRAME_WIDTH: usize = 160;
/// Full-scale synthetic frame height.
const FRAME_HEIGHT: usize = 120;
/// 20 ms of 16-bit mono audio at 8 kHz.
const AUDIO_CHUNK: usize = 320;
const AUDIO_PERIOD: Duration = Duration::from_millis(20);
/// Log a receive summary every this many samples.
const REPORT_EVERY: u64 = 100;

/// Hands out synthetic sources and logging sinks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticMedia;

impl MediaBackend for SyntheticMedia {
    fn source(&self, kind: MediaKind) -> NodeResult<Box<dyn MediaSource>> {
        Ok(match kind {
            MediaKind::Video => Box::new(TestPattern::default()),
            MediaKind::Audio => Box::new(Silence),
        })
    }

    fn sink(&self, kind: MediaKind, peer: PeerId) -> NodeResult<Box<dyn MediaSink>> {
        Ok(Box::new(CountingSink::new(kind, peer)))
    }
}

/// Moving gradient, one byte per pixel.
#[derive(Debug, Default)]
pub struct TestPattern {
    frame: u8,
}

impl TestPattern {
    /// Frame dimensions for a resize ratio; never below 1x1.
    pub fn dimensions(scale: f64) -> (usize, usize) {
        let scale = scale.clamp(0.0, 1.0);
        let width = ((FRAME_WIDTH as f64 * scale) as usize).max(1);
        let height = ((FRAME_HEIGHT as f64 * scale) as usize).max(1);
        (width, height)
    }
}

#[async_trait]
impl MediaSource for TestPattern {
    async fn capture(&mut self, scale: f64) -> NodeResult<Vec<u8>> {
        let (width, height) = Self::dimensions(scale);
        let offset = self.frame;
        self.frame = self.frame.wrapping_add(1);
        let mut frame = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                frame.push((x + y) as u8 ^ offset);
            }
        }
        Ok(frame)
    }
}

/// Paced silent audio.
#[derive(Debug)]
pub struct Silence;

#[async_trait]
impl MediaSource for Silence {
    async fn capture(&mut self, _scale: f64) -> NodeResult<Vec<u8>> {
        tokio::time::sleep(AUDIO_PERIOD).await;
        Ok(vec![0; AUDIO_CHUNK])
    }
}

/// Counts what a peer sends us.
#[derive(Debug)]
pub struct CountingSink {
    kind: MediaKind,
    peer: PeerId,
    samples: u64,
    bytes: u64,
}

impl CountingSink {
    pub fn new(kind: MediaKind, peer: PeerId) -> Self {
        Self {
            kind,
            peer,
            samples: 0,
            bytes: 0,
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[async_trait]
impl MediaSink for CountingSink {
    async fn render(&mut self, sample: MediaSample) -> NodeResult<()> {
        self.samples += 1;
        self.bytes += sample.data.len() as u64;
        if self.samples % REPORT_EVERY == 0 {
            info!(
                peer = %self.peer,
                kind = self.kind.label(),
                samples = self.samples,
                bytes = self.bytes,
                scale = sample.scale_permille,
                "Receiving media"
            );
        } else {
            debug!(peer = %self.peer, kind = self.kind.label(), sequence = sample.sequence, "Media sample");
        }
        Ok(())
    }
}
