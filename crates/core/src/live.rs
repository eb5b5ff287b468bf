//! The live loop: one composition run feeding one sink.
//!
//! ```text
//!   start ──► open sources ──► sink.start(primer) ──► tick thread
//!                                                        │
//!       ┌────────────────────────────────────────────────┘
//!       ▼
//!   gather latest_frame() ─► compose ─► sink.push ─► pace to fps ─┐
//!       ▲                                                          │
//!       └──────────────────────────────────────────────────────────┘
//!
//!   cancel / CloseRequested / push error:
//!       sink.stop() → sources close() → on_exit(LoopExit)
//! ```
//!
//! Ticks never overlap and never queue: a tick that overruns its slot is
//! followed immediately by the next one, and the schedule restarts from
//! now. Under load the loop drops frames instead of building a backlog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::compositor::{CompositeFrame, CompositorConfig, compose};
use crate::error::{MosaicError, Result};
use crate::registry::Channel;
use crate::sink::{OutputSink, PushOutcome, SinkReady};
use crate::source::{DecoderFactory, FrameSource, SourceFrame, SourceSettings};

/// Longest uninterrupted sleep between cancellation checks.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub compositor: CompositorConfig,
    pub fps: u32,
    pub source: SourceSettings,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            compositor: CompositorConfig::default(),
            fps: crate::session::target::DEFAULT_FPS,
            source: SourceSettings::default(),
        }
    }
}

/// How a loop ended. Reported once, after every resource is released.
#[derive(Debug)]
pub enum LoopExit {
    /// [`RunningLoop::cancel`] was called.
    Cancelled,
    /// The operator closed the display.
    CloseRequested,
    /// The sink failed while running.
    Crashed(MosaicError),
}

/// A configured loop that has not started yet.
pub struct LiveLoop {
    channels: Vec<Channel>,
    sink: Box<dyn OutputSink>,
    decoders: Arc<dyn DecoderFactory>,
    config: LoopConfig,
}

impl LiveLoop {
    pub fn new(
        channels: Vec<Channel>,
        sink: Box<dyn OutputSink>,
        decoders: Arc<dyn DecoderFactory>,
        config: LoopConfig,
    ) -> Self {
        Self {
            channels,
            sink,
            decoders,
            config,
        }
    }

    /// Open every source, bring the sink up, and start ticking.
    ///
    /// Returns once the sink is ready. If the sink fails to start, every
    /// source is closed again and the error is returned; `on_exit` is not
    /// called in that case.
    pub fn start(
        mut self,
        on_exit: impl FnOnce(LoopExit) + Send + 'static,
    ) -> Result<(RunningLoop, SinkReady)> {
        let tile = self.config.compositor.tile_size(self.channels.len());
        let sources: Vec<Tile> = self
            .channels
            .iter()
            .map(|channel| {
                let source = FrameSource::open(channel, self.decoders.clone(), tile, &self.config.source)
                    .inspect_err(|e| {
                        tracing::warn!(channel = %channel.name, error = %e, "source unavailable, showing placeholder");
                    })
                    .ok();
                Tile {
                    name: channel.name.clone(),
                    source,
                }
            })
            .collect();

        let primer = gather_and_compose(&sources, &self.config.compositor);
        let ready = match self.sink.start(&primer) {
            Ok(ready) => ready,
            Err(e) => {
                close_all(sources);
                return Err(e);
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let ticker = Ticker {
            sources,
            sink: self.sink,
            config: self.config,
            cancel: cancel.clone(),
            frames: frames.clone(),
        };
        let handle = thread::Builder::new()
            .name("live-loop".to_string())
            .spawn(move || {
                let exit = ticker.run();
                on_exit(exit);
            })?;

        Ok((
            RunningLoop {
                cancel,
                frames,
                handle: Some(handle),
            },
            ready,
        ))
    }
}

/// Handle to a ticking loop.
pub struct RunningLoop {
    cancel: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl RunningLoop {
    /// Ask the loop to stop at the next tick boundary. Returns immediately.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for teardown to finish (including the `on_exit` callback).
    ///
    /// A no-op when called from the loop thread itself, which happens when
    /// the last owner of this handle is dropped inside `on_exit`.
    pub fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("live loop thread panicked");
        }
    }

    /// Composite frames delivered so far.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Drop for RunningLoop {
    fn drop(&mut self) {
        self.cancel();
        self.join();
    }
}

struct Tile {
    name: String,
    /// `None` when the source could not be opened at all.
    source: Option<FrameSource>,
}

fn gather_and_compose(tiles: &[Tile], config: &CompositorConfig) -> CompositeFrame {
    let inputs: Vec<(String, SourceFrame)> = tiles
        .iter()
        .map(|tile| {
            let frame = tile
                .source
                .as_ref()
                .map_or(SourceFrame::Failed, FrameSource::latest_frame);
            (tile.name.clone(), frame)
        })
        .collect();
    compose(&inputs, config)
}

fn close_all(tiles: Vec<Tile>) {
    for mut tile in tiles {
        if let Some(source) = tile.source.as_mut() {
            source.close();
        }
    }
}

struct Ticker {
    sources: Vec<Tile>,
    sink: Box<dyn OutputSink>,
    config: LoopConfig,
    cancel: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl Ticker {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn run(mut self) -> LoopExit {
        let interval = Duration::from_secs(1) / self.config.fps.max(1);
        let mut next = Instant::now();
        let mut dropped = 0u64;
        tracing::debug!(sources = self.sources.len(), fps = self.config.fps, "live loop running");

        let exit = loop {
            if self.cancelled() {
                break LoopExit::Cancelled;
            }

            let composite = gather_and_compose(&self.sources, &self.config.compositor);
            match self.sink.push(&composite) {
                Ok(PushOutcome::Continue) => {
                    let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::trace!(frame = n, "tick");
                }
                Ok(PushOutcome::CloseRequested) => break LoopExit::CloseRequested,
                Err(e) => {
                    tracing::warn!(error = %e, "sink failed, stopping live loop");
                    break LoopExit::Crashed(e);
                }
            }

            next += interval;
            let now = Instant::now();
            if next <= now {
                // Overran the slot: continue from now, do not catch up.
                dropped += 1;
                next = now;
            } else {
                self.sleep_until(next);
            }
        };

        tracing::debug!(
            frames = self.frames.load(Ordering::Relaxed),
            late_ticks = dropped,
            "live loop stopping"
        );
        self.sink.stop();
        close_all(self.sources);
        exit
    }

    fn sleep_until(&self, deadline: Instant) {
        loop {
            if self.cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}
