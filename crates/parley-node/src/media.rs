//! Media calls.
//!
//! A call runs four loops over four TCP connections. Each side listens for
//! the peer's video and audio on its own [`MediaListeners`] and dials the
//! peer's listeners with its own senders:
//!
//! ```text
//!   A video-send ----> B video-recv      B video-send ----> A video-recv
//!   A audio-send ----> B audio-recv      B audio-send ----> A audio-recv
//! ```
//!
//! Every frame is a [`MediaSample`] behind the same 4-byte big-endian length
//! prefix the control channel uses. The call ends as soon as any loop ends.

use std::time::Duration;

use async_trait::async_trait;
use parley_core::{PeerAddress, PeerId};
use parley_protocol::{MediaKind, MediaPorts, MediaSample};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;
use crate::error::{NodeError, NodeResult};
use crate::signals::ShutdownHandle;
use crate::wire::{connect_with_retry, read_frame, write_frame};

/// Multiplicative step of the rate controller.
const RATE_STEP: f64 = 0.9;

/// Produces raw samples (camera frames, microphone chunks).
#[async_trait]
pub trait MediaSource: Send {
    /// Captures the next sample, resized by `scale` where that applies.
    async fn capture(&mut self, scale: f64) -> NodeResult<Vec<u8>>;
}

/// Consumes samples received from a peer (screen, speaker).
#[async_trait]
pub trait MediaSink: Send {
    async fn render(&mut self, sample: MediaSample) -> NodeResult<()>;
}

/// Hands out sources and sinks for a call.
pub trait MediaBackend: Send + Sync {
    fn source(&self, kind: MediaKind) -> NodeResult<Box<dyn MediaSource>>;
    fn sink(&self, kind: MediaKind, peer: PeerId) -> NodeResult<Box<dyn MediaSink>>;
}

/// Keeps the video frame rate near a target by trading resolution.
///
/// Every `update_window` frames the frequency observed since the call
/// started is compared with the target: above `target / 0.9` the ratio is
/// multiplied by 0.9, below `target * 0.9` it is divided by 0.9. The ratio
/// always stays within `[worst_ratio, 1.0]`.
#[derive(Debug, Clone)]
pub struct RateController {
    target: f64,
    worst: f64,
    window: u64,
    ratio: f64,
    frames: u64,
    started: Instant,
}

impl RateController {
    /// A controller starting at full scale.
    pub fn new(config: &MediaConfig, started: Instant) -> Self {
        Self {
            target: config.target_frequency,
            worst: config.worst_ratio.clamp(f64::MIN_POSITIVE, 1.0),
            window: u64::from(config.update_window.max(1)),
            ratio: 1.0,
            frames: 0,
            started,
        }
    }

    /// Builder: start from another ratio.
    #[must_use]
    pub fn starting_at(mut self, ratio: f64) -> Self {
        self.ratio = ratio.clamp(self.worst, 1.0);
        self
    }

    /// Current resize ratio.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Frames per second since the start.
    pub fn observed_frequency(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.frames as f64 / elapsed
    }

    /// Counts one produced frame and returns the ratio for the next one.
    pub fn record_frame(&mut self, now: Instant) -> f64 {
        self.frames += 1;
        if self.frames % self.window != 0 {
            return self.ratio;
        }
        let frequency = self.observed_frequency(now);
        let previous = self.ratio;
        if frequency > self.target / RATE_STEP {
            self.ratio *= RATE_STEP;
        } else if frequency < self.target * RATE_STEP {
            self.ratio /= RATE_STEP;
        }
        self.ratio = self.ratio.clamp(self.worst, 1.0);
        if self.ratio != previous {
            debug!(frequency, from = previous, to = self.ratio, "Resize ratio updated");
        }
        self.ratio
    }
}

/// Our two receiver sockets, bound before the call is signalled so their
/// ports can be announced.
#[derive(Debug)]
pub struct MediaListeners {
    video: TcpListener,
    audio: TcpListener,
}

impl MediaListeners {
    pub async fn bind(host: &str, config: &MediaConfig) -> NodeResult<Self> {
        let video = TcpListener::bind((host, config.video_port)).await?;
        let audio = TcpListener::bind((host, config.audio_port)).await?;
        Ok(Self { video, audio })
    }

    /// Ports actually bound.
    pub fn ports(&self) -> NodeResult<MediaPorts> {
        Ok(MediaPorts::new(
            self.video.local_addr()?.port(),
            self.audio.local_addr()?.port(),
        ))
    }
}

/// Where the peer's receivers listen.
#[derive(Debug, Clone)]
pub struct MediaPeer {
    pub id: PeerId,
    pub host: String,
    pub ports: MediaPorts,
}

impl MediaPeer {
    fn address(&self, kind: MediaKind) -> PeerAddress {
        let port = match kind {
            MediaKind::Video => self.ports.video,
            MediaKind::Audio => self.ports.audio,
        };
        PeerAddress::new(self.host.clone(), port)
    }
}

/// One live call.
#[derive(Debug)]
pub struct MediaStreamSession {
    peer: PeerId,
    shutdown: ShutdownHandle,
    supervisor: JoinHandle<()>,
}

impl MediaStreamSession {
    /// Starts the four loops. `on_end` runs once with the reason the call
    /// ended, whoever ended it.
    pub fn start<F>(
        peer: MediaPeer,
        listeners: MediaListeners,
        backend: &dyn MediaBackend,
        config: MediaConfig,
        retry_interval: Duration,
        on_end: F,
    ) -> NodeResult<Self>
    where
        F: FnOnce(String) + Send + 'static,
    {
        let video_source = backend.source(MediaKind::Video)?;
        let audio_source = backend.source(MediaKind::Audio)?;
        let video_sink = backend.sink(MediaKind::Video, peer.id)?;
        let audio_sink = backend.sink(MediaKind::Audio, peer.id)?;

        let shutdown = ShutdownHandle::new();
        let started = Instant::now();
        let mut loops = JoinSet::new();

        let video_sender = Sender {
            kind: MediaKind::Video,
            address: peer.address(MediaKind::Video),
            source: video_source,
            rate: Some(RateController::new(&config, started)),
            pause: config.frame_interval,
            retry_interval,
            started,
        };
        let audio_sender = Sender {
            kind: MediaKind::Audio,
            address: peer.address(MediaKind::Audio),
            source: audio_source,
            rate: None,
            pause: Duration::ZERO,
            retry_interval,
            started,
        };
        loops.spawn(send_loop(video_sender, shutdown.clone()));
        loops.spawn(send_loop(audio_sender, shutdown.clone()));
        loops.spawn(receive_loop(
            MediaKind::Video,
            listeners.video,
            video_sink,
            shutdown.clone(),
        ));
        loops.spawn(receive_loop(
            MediaKind::Audio,
            listeners.audio,
            audio_sink,
            shutdown.clone(),
        ));

        info!(peer = %peer.id, host = %peer.host, video = peer.ports.video, audio = peer.ports.audio, "Call started");
        let supervisor = tokio::spawn(supervise(peer.id, loops, shutdown.clone(), on_end));
        Ok(Self {
            peer: peer.id,
            shutdown,
            supervisor,
        })
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// True until the first loop ends or [`stop`](Self::stop) is called.
    pub fn is_alive(&self) -> bool {
        !self.shutdown.is_shutdown() && !self.supervisor.is_finished()
    }

    /// Ends the call.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

async fn supervise<F>(
    peer: PeerId,
    mut loops: JoinSet<LoopOutcome>,
    shutdown: ShutdownHandle,
    on_end: F,
) where
    F: FnOnce(String),
{
    let reason = tokio::select! {
        biased;
        _ = shutdown.cancelled() => "hung up".to_string(),
        first = loops.join_next() => match first {
            Some(Ok((kind, direction, Ok(())))) => format!("{} {direction} closed", kind.label()),
            Some(Ok((kind, direction, Err(e)))) => {
                warn!(%peer, media = kind.label(), direction, error = %e, "Media loop failed");
                format!("{} {direction} failed: {e}", kind.label())
            }
            Some(Err(e)) => format!("media task failed: {e}"),
            None => "no media loops".to_string(),
        },
    };
    shutdown.trigger();
    loops.shutdown().await;
    info!(%peer, %reason, "Call ended");
    on_end(reason);
}

/// Outcome of one media loop: channel, direction, result.
type LoopOutcome = (MediaKind, &'static str, NodeResult<()>);

struct Sender {
    kind: MediaKind,
    address: PeerAddress,
    source: Box<dyn MediaSource>,
    rate: Option<RateController>,
    pause: Duration,
    retry_interval: Duration,
    started: Instant,
}

async fn send_loop(mut sender: Sender, shutdown: ShutdownHandle) -> LoopOutcome {
    let result = sender.run(&shutdown).await;
    (sender.kind, "send", filter_cancelled(result))
}

impl Sender {
    async fn run(&mut self, shutdown: &ShutdownHandle) -> NodeResult<()> {
        let mut stream = connect_with_retry(&self.address, self.retry_interval, shutdown).await?;
        debug!(media = self.kind.label(), address = %self.address, "Media sender connected");
        let mut sequence: u32 = 0;
        let mut scale = self.rate.as_ref().map_or(1.0, RateController::ratio);
        loop {
            let data = tokio::select! {
                data = self.source.capture(scale) => data?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let now = Instant::now();
            let capture_ms =
                u64::try_from(now.duration_since(self.started).as_millis()).unwrap_or(u64::MAX);
            let sample = MediaSample::new(self.kind, sequence, capture_ms, data).with_scale(scale);
            write_frame(&mut stream, &sample.encode()).await?;
            sequence = sequence.wrapping_add(1);

            if let Some(rate) = self.rate.as_mut() {
                scale = rate.record_frame(now);
            }
            if !self.pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.pause) => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }
        }
    }
}

async fn receive_loop(
    kind: MediaKind,
    listener: TcpListener,
    mut sink: Box<dyn MediaSink>,
    shutdown: ShutdownHandle,
) -> LoopOutcome {
    let result = receive_samples(kind, &listener, sink.as_mut(), &shutdown).await;
    (kind, "receive", filter_cancelled(result))
}

async fn receive_samples(
    kind: MediaKind,
    listener: &TcpListener,
    sink: &mut dyn MediaSink,
    shutdown: &ShutdownHandle,
) -> NodeResult<()> {
    let (mut stream, remote): (TcpStream, _) = tokio::select! {
        accepted = listener.accept() => accepted?,
        _ = shutdown.cancelled() => return Ok(()),
    };
    debug!(media = kind.label(), %remote, "Media receiver connected");
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut stream) => frame?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        match MediaSample::decode(&frame) {
            Ok(sample) if sample.kind == kind => sink.render(sample).await?,
            Ok(sample) => {
                debug!(expected = kind.label(), got = sample.kind.label(), "Dropping sample on wrong channel");
            }
            Err(e) => debug!(media = kind.label(), error = %e, "Dropping undecodable sample"),
        }
    }
}

fn filter_cancelled(result: NodeResult<()>) -> NodeResult<()> {
    match result {
        Err(NodeError::Cancelled) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn config(target: f64, worst: f64, window: u32) -> MediaConfig {
        MediaConfig::default().with_rate_control(target, worst, window)
    }

    /// Feeds frames at a fixed rate and returns every ratio produced.
    fn drive(controller: &mut RateController, start: Instant, fps: f64, frames: u32) -> Vec<f64> {
        (1..=frames)
            .map(|n| {
                let now = start + Duration::from_secs_f64(f64::from(n) / fps);
                controller.record_frame(now)
            })
            .collect()
    }

    #[test]
    fn fast_producer_shrinks_to_floor() {
        let start = Instant::now();
        let mut controller = RateController::new(&config(10.0, 0.5, 10), start);
        let ratios = drive(&mut controller, start, 40.0, 400);

        assert!(ratios.windows(2).all(|w| w[1] <= w[0]));
        assert!(ratios.iter().all(|&r| r >= 0.5));
        assert_eq!(controller.ratio(), 0.5);
        assert!((ratios[9] - 0.9).abs() < 1e-9);
    }

    #[test]
    fn slow_producer_grows_to_full_scale() {
        let start = Instant::now();
        let mut controller = RateController::new(&config(10.0, 0.25, 5), start).starting_at(0.3);
        let ratios = drive(&mut controller, start, 2.0, 200);

        assert!(ratios.windows(2).all(|w| w[1] >= w[0]));
        assert!(ratios.iter().all(|&r| r <= 1.0));
        assert_eq!(controller.ratio(), 1.0);
    }

    #[test]
    fn on_target_holds_steady() {
        let start = Instant::now();
        let mut controller = RateController::new(&config(10.0, 0.5, 10), start).starting_at(0.7);
        let ratios = drive(&mut controller, start, 10.0, 100);
        assert!(ratios.iter().all(|&r| (r - 0.7).abs() < 1e-9));
    }

    #[test]
    fn ratio_only_changes_on_window_boundaries() {
        let start = Instant::now();
        let mut controller = RateController::new(&config(10.0, 0.1, 4), start);
        let ratios = drive(&mut controller, start, 100.0, 8);
        assert_eq!(&ratios[..3], &[1.0, 1.0, 1.0]);
        assert!(ratios[3] < 1.0);
        assert_eq!(ratios[4], ratios[3]);
        assert!(ratios[7] < ratios[3]);
    }

    struct Counter {
        kind: MediaKind,
    }

    #[async_trait]
    impl MediaSource for Counter {
        async fn capture(&mut self, scale: f64) -> NodeResult<Vec<u8>> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(vec![self.kind as u8, (scale * 100.0) as u8])
        }
    }

    type Seen = Arc<Mutex<Vec<MediaSample>>>;

    struct Recorder {
        seen: Seen,
    }

    #[async_trait]
    impl MediaSink for Recorder {
        async fn render(&mut self, sample: MediaSample) -> NodeResult<()> {
            self.seen.lock().unwrap().push(sample);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestBackend {
        seen: Seen,
    }

    impl MediaBackend for TestBackend {
        fn source(&self, kind: MediaKind) -> NodeResult<Box<dyn MediaSource>> {
            Ok(Box::new(Counter { kind }))
        }

        fn sink(&self, _kind: MediaKind, _peer: PeerId) -> NodeResult<Box<dyn MediaSink>> {
            Ok(Box::new(Recorder {
                seen: self.seen.clone(),
            }))
        }
    }

    fn media() -> MediaConfig {
        MediaConfig::default()
            .with_ports(0, 0)
            .with_frame_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn call_streams_both_ways_and_ends_together() {
        let a_id: PeerId = "1111111111".parse().unwrap();
        let b_id: PeerId = "2222222222".parse().unwrap();
        let a_listeners = MediaListeners::bind("127.0.0.1", &media()).await.unwrap();
        let b_listeners = MediaListeners::bind("127.0.0.1", &media()).await.unwrap();
        let a_ports = a_listeners.ports().unwrap();
        let b_ports = b_listeners.ports().unwrap();

        let a_backend = TestBackend::default();
        let b_backend = TestBackend::default();
        let (a_done, a_ended) = oneshot::channel();
        let (b_done, b_ended) = oneshot::channel();
        let retry = Duration::from_millis(10);

        let a = MediaStreamSession::start(
            MediaPeer {
                id: b_id,
                host: "127.0.0.1".into(),
                ports: b_ports,
            },
            a_listeners,
            &a_backend,
            media(),
            retry,
            move |reason| {
                let _ = a_done.send(reason);
            },
        )
        .unwrap();
        let b = MediaStreamSession::start(
            MediaPeer {
                id: a_id,
                host: "127.0.0.1".into(),
                ports: a_ports,
            },
            b_listeners,
            &b_backend,
            media(),
            retry,
            move |reason| {
                let _ = b_done.send(reason);
            },
        )
        .unwrap();
        assert!(a.is_alive());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let kinds: Vec<_> = a_backend.seen.lock().unwrap().iter().map(|s| s.kind).collect();
                if kinds.contains(&MediaKind::Video) && kinds.contains(&MediaKind::Audio) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        a.stop();
        let a_reason = tokio::time::timeout(Duration::from_secs(5), a_ended).await.unwrap().unwrap();
        assert_eq!(a_reason, "hung up");
        let b_reason = tokio::time::timeout(Duration::from_secs(5), b_ended).await.unwrap().unwrap();
        assert!(!b_reason.is_empty());
        assert!(!a.is_alive());
        assert!(!b.is_alive());

        let video: Vec<_> = b_backend
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.kind == MediaKind::Video)
            .map(|s| s.sequence)
            .collect();
        assert!(video.windows(2).all(|w| w[1] == w[0] + 1));
    }
}
