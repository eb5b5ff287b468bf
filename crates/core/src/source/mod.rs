//! Frame sources: one puller thread per network feed.
//!
//! A [`FrameSource`] keeps the most recent decoded frame of one channel.
//! Its puller thread reads and decodes at the feed's own pace, so a slow or
//! frozen feed never stalls the live loop; the loop only ever takes a cheap
//! snapshot via [`FrameSource::latest_frame`].
//!
//! ## Puller lifecycle
//!
//! ```text
//!   open ──ok──► read frames ──error/EOF──┐
//!    ▲                                    │
//!    └──── backoff (500ms → 8s) ◄─────────┘ ── max_failures reached ──► Failed
//! ```
//!
//! Decode failures never propagate as errors. They surface as
//! [`SourceFrame::Stale`], [`SourceFrame::Absent`] or [`SourceFrame::Failed`],
//! which the compositor paints as degraded tiles.

pub mod ffmpeg;
pub mod pattern;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::{MosaicError, Result};
use crate::media::Frame;
use crate::media::transform::FrameTransform;
use crate::registry::Channel;

pub use ffmpeg::FfmpegDecoderFactory;
pub use pattern::PatternDecoderFactory;

/// Poll granularity for interruptible sleeps.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Snapshot of a source as seen by the compositor.
#[derive(Debug, Clone)]
pub enum SourceFrame {
    /// A frame newer than the staleness window.
    Fresh(Arc<Frame>),
    /// The last good frame; nothing newer arrived within the window.
    Stale(Arc<Frame>),
    /// No frame has ever been decoded.
    Absent,
    /// The source gave up reconnecting, or could not be opened at all.
    Failed,
}

impl SourceFrame {
    /// Anything but a fresh frame.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Fresh(_))
    }

    pub fn frame(&self) -> Option<&Arc<Frame>> {
        match self {
            Self::Fresh(f) | Self::Stale(f) => Some(f),
            Self::Absent | Self::Failed => None,
        }
    }
}

/// Exponential reconnect schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << shift).min(self.max)
    }
}

/// Per-source pull settings.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// A frame older than this is reported stale.
    pub stale_after: Duration,
    pub backoff: Backoff,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_failures: Option<u32>,
    /// Decoder input options (`-key value` for ffmpeg).
    pub input_options: BTreeMap<String, String>,
    /// Rotation and trim for the feed being opened. Taken from the channel
    /// when its source opens.
    pub transform: FrameTransform,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_millis(500),
            backoff: Backoff::default(),
            max_failures: None,
            input_options: BTreeMap::new(),
            transform: FrameTransform::default(),
        }
    }
}

impl SourceSettings {
    /// Widen the staleness window to twice the frame interval at `fps`.
    /// The configured window stays as the floor.
    pub fn for_fps(mut self, fps: u32) -> Self {
        let interval = Duration::from_secs(1) / fps.max(1);
        self.stale_after = self.stale_after.max(interval * 2);
        self
    }
}

/// Unblocks a decoder's pending read from another thread.
#[derive(Clone)]
pub struct Canceller(Arc<dyn Fn() + Send + Sync>);

impl Canceller {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// For decoders whose reads return promptly on their own.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn cancel(&self) {
        (self.0)()
    }
}

/// An open decode handle for one feed.
pub trait Decoder: Send {
    /// Block until the next frame is decoded. An error ends this connection;
    /// the puller reconnects according to its backoff.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Handle that makes a blocked [`next_frame`](Self::next_frame) return.
    fn canceller(&self) -> Canceller;
}

/// Opens decoders for source URLs.
///
/// `width × height` is the tile size the mosaic will draw the feed at;
/// decoders may scale to it to save compositing work.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, url: &str, width: u32, height: u32, settings: &SourceSettings) -> Result<Box<dyn Decoder>>;

    /// Cheap syntactic check run before a puller is spawned.
    fn supports(&self, url: &str) -> bool {
        url.contains("://")
    }
}

/// Sends `pattern://` URLs to the pattern generator and everything else to
/// ffmpeg.
pub struct RoutingDecoderFactory {
    pattern: PatternDecoderFactory,
    network: Arc<dyn DecoderFactory>,
}

impl RoutingDecoderFactory {
    pub fn new(network: Arc<dyn DecoderFactory>) -> Self {
        Self {
            pattern: PatternDecoderFactory::default(),
            network,
        }
    }
}

impl Default for RoutingDecoderFactory {
    fn default() -> Self {
        Self::new(Arc::new(FfmpegDecoderFactory::default()))
    }
}

impl DecoderFactory for RoutingDecoderFactory {
    fn open(&self, url: &str, width: u32, height: u32, settings: &SourceSettings) -> Result<Box<dyn Decoder>> {
        if self.pattern.supports(url) {
            self.pattern.open(url, width, height, settings)
        } else {
            self.network.open(url, width, height, settings)
        }
    }

    fn supports(&self, url: &str) -> bool {
        self.pattern.supports(url) || self.network.supports(url)
    }
}

#[derive(Default)]
struct Slot {
    frame: Option<Arc<Frame>>,
    updated_at: Option<Instant>,
    gave_up: bool,
}

struct Shared {
    slot: RwLock<Slot>,
    stop: AtomicBool,
    canceller: Mutex<Option<Canceller>>,
}

/// Latest-frame cache for one channel, fed by its own puller thread.
pub struct FrameSource {
    channel: Channel,
    shared: Arc<Shared>,
    stale_after: Duration,
    puller: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Validate the channel URL and start pulling.
    ///
    /// Fails with [`MosaicError::SourceUnavailable`] when the URL is empty
    /// or no decoder understands it. Network failures after this point are
    /// absorbed and retried.
    pub fn open(
        channel: &Channel,
        factory: Arc<dyn DecoderFactory>,
        tile: (u32, u32),
        settings: &SourceSettings,
    ) -> Result<Self> {
        if !channel.has_source() {
            return Err(MosaicError::source_unavailable(&channel.url, "no address configured"));
        }
        if !factory.supports(&channel.url) {
            return Err(MosaicError::source_unavailable(&channel.url, "unsupported URL"));
        }

        let shared = Arc::new(Shared {
            slot: RwLock::new(Slot::default()),
            stop: AtomicBool::new(false),
            canceller: Mutex::new(None),
        });

        let puller = Puller {
            channel: channel.clone(),
            factory,
            tile,
            settings: SourceSettings {
                transform: channel.transform,
                ..settings.clone()
            },
            shared: shared.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("source-{}", channel.name))
            .spawn(move || puller.run())?;

        Ok(Self {
            channel: channel.clone(),
            shared,
            stale_after: settings.stale_after,
            puller: Some(handle),
        })
    }

    /// Snapshot of the most recent frame. Never waits on the network.
    pub fn latest_frame(&self) -> SourceFrame {
        let slot = self.shared.slot.read();
        if slot.gave_up {
            return SourceFrame::Failed;
        }
        match (&slot.frame, slot.updated_at) {
            (Some(frame), Some(at)) if at.elapsed() <= self.stale_after => {
                SourceFrame::Fresh(frame.clone())
            }
            (Some(frame), _) => SourceFrame::Stale(frame.clone()),
            (None, _) => SourceFrame::Absent,
        }
    }

    /// Stop the puller and release the decode handle. Idempotent.
    pub fn close(&mut self) {
        let Some(handle) = self.puller.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(canceller) = self.shared.canceller.lock().take() {
            canceller.cancel();
        }
        if handle.join().is_err() {
            tracing::error!(channel = %self.channel.name, "source puller panicked");
        }
        tracing::debug!(channel = %self.channel.name, "source closed");
    }

    pub fn is_closed(&self) -> bool {
        self.puller.is_none()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

struct Puller {
    channel: Channel,
    factory: Arc<dyn DecoderFactory>,
    tile: (u32, u32),
    settings: SourceSettings,
    shared: Arc<Shared>,
}

impl Puller {
    fn stopping(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    fn run(self) {
        let name = &self.channel.name;
        let url = &self.channel.url;
        let mut failures = 0u32;

        while !self.stopping() {
            match self
                .factory
                .open(url, self.tile.0, self.tile.1, &self.settings)
            {
                Ok(decoder) => {
                    if self.pull(decoder) {
                        failures = 0;
                    }
                }
                Err(e) => tracing::warn!(channel = %name, %url, error = %e, "source open failed"),
            }
            if self.stopping() {
                break;
            }

            failures += 1;
            if let Some(max) = self.settings.max_failures
                && failures >= max
            {
                tracing::warn!(channel = %name, %url, failures, "giving up on source");
                self.shared.slot.write().gave_up = true;
                break;
            }

            let delay = self.settings.backoff.delay(failures);
            tracing::debug!(channel = %name, failures, ?delay, "source reconnect scheduled");
            self.sleep(delay);
        }
        tracing::trace!(channel = %name, "puller exited");
    }

    /// Read frames until the decoder fails or the source is closed.
    /// Returns whether at least one frame arrived.
    fn pull(&self, mut decoder: Box<dyn Decoder>) -> bool {
        *self.shared.canceller.lock() = Some(decoder.canceller());
        // close() may have run before the canceller was installed.
        if self.stopping() {
            self.shared.canceller.lock().take();
            return false;
        }
        tracing::info!(channel = %self.channel.name, url = %self.channel.url, "source connected");

        let mut received = false;
        while !self.stopping() {
            match decoder.next_frame() {
                Ok(frame) => {
                    received = true;
                    let mut slot = self.shared.slot.write();
                    slot.frame = Some(Arc::new(frame));
                    slot.updated_at = Some(Instant::now());
                }
                Err(e) => {
                    if !self.stopping() {
                        tracing::warn!(channel = %self.channel.name, error = %e, "source read failed");
                    }
                    break;
                }
            }
        }
        self.shared.canceller.lock().take();
        received
    }

    fn sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}
