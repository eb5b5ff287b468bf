//! Output sinks: where composite frames go.
//!
//! | Sink | Process | Ready when | Artifact |
//! |------|---------|------------|----------|
//! | [`RtpSink`] | encoder (`ffmpeg -f rtp`) | encoder SDP written | `mosaic.sdp` |
//! | [`HlsSink`] | encoder (`ffmpeg -f hls`) | playlist starts with `#EXTM3U` | `index.m3u8` |
//! | [`WindowSink`] | player (`ffplay`) | player survives the settle period | none |
//!
//! All three share one contract. [`OutputSink::start`] either returns a
//! running sink or fails within its startup timeout, leaving no child
//! process and no scratch files behind. [`OutputSink::push`] never waits on
//! the child: a busy child drops the frame, a dead one is
//! [`MosaicError::SinkCrashed`]. [`OutputSink::stop`] is idempotent and
//! bounded by the stop grace period.

pub mod hls;
pub mod process;
pub mod rtp;
pub mod sdp;
pub mod window;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::compositor::CompositeFrame;
use crate::error::{MosaicError, Result};
use crate::session::target::{OutputTarget, Protocol};

pub use hls::HlsSink;
pub use process::ManagedProcess;
pub use rtp::RtpSink;
pub use window::WindowSink;

/// What the live loop should do after a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Continue,
    /// The operator closed the display; stop as if cancelled.
    CloseRequested,
}

/// Where a remote viewer finds the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum SessionArtifact {
    Sdp(PathBuf),
    Playlist(PathBuf),
}

impl SessionArtifact {
    pub fn path(&self) -> &Path {
        match self {
            Self::Sdp(p) | Self::Playlist(p) => p,
        }
    }
}

/// Result of a successful [`OutputSink::start`].
#[derive(Debug, Clone, Default)]
pub struct SinkReady {
    pub artifact: Option<SessionArtifact>,
    pub pid: Option<u32>,
}

/// Consumer of composite frames.
pub trait OutputSink: Send {
    /// Bring the sink up, using `primer` as the first picture.
    ///
    /// Returns once the sink is ready. On error nothing is left running.
    fn start(&mut self, primer: &CompositeFrame) -> Result<SinkReady>;

    /// Deliver one frame. Must not block indefinitely.
    fn push(&mut self, frame: &CompositeFrame) -> Result<PushOutcome>;

    /// Release the process and scratch files. Idempotent.
    fn stop(&mut self);
}

/// Per-session inputs for building a sink.
#[derive(Debug, Clone)]
pub struct SinkContext {
    /// Private directory for this session's files. Created by the sink,
    /// removed on stop.
    pub scratch_dir: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Human-readable title (SDP session name, window title).
    pub title: String,
}

/// Builds sinks for output targets.
pub trait SinkFactory: Send + Sync {
    fn create(&self, target: &OutputTarget, context: SinkContext) -> Result<Box<dyn OutputSink>>;
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Encoder and player invocation settings.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub encoder_program: String,
    pub player_program: String,
    pub rtp_args: Vec<String>,
    pub hls_args: Vec<String>,
    pub window_args: Vec<String>,
    /// Expanded where a template says `{options}`; per-target options win.
    pub default_options: BTreeMap<String, String>,
    pub rtp_startup_timeout: Duration,
    pub hls_startup_timeout: Duration,
    /// How long a player must stay up before a window counts as open.
    pub window_settle: Duration,
    /// Wait after closing stdin before a child is killed.
    pub stop_grace: Duration,
    /// A running child that takes longer than this to read one frame has
    /// stalled; the session fails with [`MosaicError::SinkWrite`].
    pub write_timeout: Duration,
    pub hls_time: f64,
    pub hls_list_size: u32,
    /// Refuse window output without `DISPLAY`/`WAYLAND_DISPLAY`.
    pub require_display: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        let raw_input = [
            "-hide_banner", "-loglevel", "error", "-y", "-f", "rawvideo", "-pix_fmt", "rgb24",
            "-s", "{width}x{height}", "-r", "{fps}", "-i", "-", "-an",
        ];
        let mut rtp_args = strings(&raw_input);
        rtp_args.extend(strings(&["{options}", "-sdp_file", "{sdp}", "-f", "rtp", "{dest}"]));

        let mut hls_args = strings(&raw_input);
        hls_args.extend(strings(&[
            "{options}",
            "-f",
            "hls",
            "-hls_time",
            "{hls_time}",
            "-hls_list_size",
            "{hls_list_size}",
            "-hls_flags",
            "delete_segments+append_list",
            "-hls_segment_filename",
            "{segment}",
            "{playlist}",
        ]));

        let window_args = strings(&[
            "-hide_banner", "-loglevel", "error", "-f", "rawvideo", "-pixel_format", "rgb24",
            "-video_size", "{width}x{height}", "-framerate", "{fps}", "-window_title", "{title}",
            "-i", "-",
        ]);

        let default_options = [
            ("c:v", "libx264"),
            ("preset", "veryfast"),
            ("tune", "zerolatency"),
            ("pix_fmt", "yuv420p"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            encoder_program: "ffmpeg".to_string(),
            player_program: "ffplay".to_string(),
            rtp_args,
            hls_args,
            window_args,
            default_options,
            rtp_startup_timeout: Duration::from_secs(5),
            hls_startup_timeout: Duration::from_secs(10),
            window_settle: Duration::from_millis(300),
            stop_grace: Duration::from_secs(2),
            write_timeout: process::DEFAULT_WRITE_TIMEOUT,
            hls_time: 1.0,
            hls_list_size: 6,
            require_display: true,
        }
    }
}

impl EncoderSettings {
    /// Defaults overlaid with the target's own options.
    pub fn merged_options(&self, target: &OutputTarget) -> BTreeMap<String, String> {
        let mut options = self.default_options.clone();
        options.extend(
            target
                .encoder_options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        options
    }
}

/// The shipped sinks: ffmpeg for RTP/HLS, ffplay for windows.
#[derive(Debug, Clone, Default)]
pub struct ProcessSinkFactory {
    pub settings: EncoderSettings,
}

impl ProcessSinkFactory {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }
}

impl SinkFactory for ProcessSinkFactory {
    fn create(&self, target: &OutputTarget, context: SinkContext) -> Result<Box<dyn OutputSink>> {
        match target.protocol {
            Protocol::Rtp => {
                let dest = target
                    .rtp_url()
                    .ok_or_else(|| MosaicError::InvalidTarget("RTP target without address".into()))?;
                Ok(Box::new(RtpSink::new(&self.settings, target, dest, context)))
            }
            Protocol::Hls => Ok(Box::new(HlsSink::new(&self.settings, target, context))),
            Protocol::Window => Ok(Box::new(WindowSink::new(&self.settings, target, context))),
        }
    }
}

/// Create a session scratch directory.
pub(crate) fn create_scratch(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| MosaicError::SinkStart(format!("cannot create {}: {e}", dir.display())))
}

/// Remove a session scratch directory. Missing is fine.
pub(crate) fn remove_scratch(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => tracing::debug!(dir = %dir.display(), "scratch directory removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "cannot remove scratch directory"),
    }
}
