//! Local display through a player subprocess.
//!
//! The player owns the window and its input handling: pressing `q`/Esc or
//! closing the window makes it exit, which the next push reports as
//! [`PushOutcome::CloseRequested`]. The live loop treats that as a normal
//! cancellation, not a crash.

use std::thread;
use std::time::{Duration, Instant};

use crate::compositor::CompositeFrame;
use crate::error::{MosaicError, Result};
use crate::session::target::OutputTarget;

use super::process::{self, ManagedProcess};
use super::{EncoderSettings, OutputSink, PushOutcome, SinkContext, SinkReady};

/// Whether a graphical display is reachable from this process.
pub fn display_available() -> bool {
    if cfg!(all(unix, not(target_os = "macos"))) {
        ["DISPLAY", "WAYLAND_DISPLAY"]
            .iter()
            .any(|var| std::env::var_os(var).is_some_and(|v| !v.is_empty()))
    } else {
        true
    }
}

pub struct WindowSink {
    program: String,
    args: Vec<String>,
    settle: Duration,
    stop_grace: Duration,
    write_timeout: Duration,
    require_display: bool,
    process: Option<ManagedProcess>,
}

impl WindowSink {
    pub fn new(settings: &EncoderSettings, target: &OutputTarget, context: SinkContext) -> Self {
        let args = process::expand(
            &settings.window_args,
            &[
                ("width", context.width.to_string()),
                ("height", context.height.to_string()),
                ("fps", target.fps.to_string()),
                ("title", context.title.clone()),
            ],
            &target.encoder_options,
        );
        Self {
            program: settings.player_program.clone(),
            args,
            settle: settings.window_settle,
            stop_grace: settings.stop_grace,
            write_timeout: settings.write_timeout,
            require_display: settings.require_display,
            process: None,
        }
    }

    fn launch(&mut self, primer: &CompositeFrame) -> Result<SinkReady> {
        let process = self.process.insert(ManagedProcess::spawn(
            "player",
            &self.program,
            &self.args,
            None,
        )?
        .with_write_timeout(self.write_timeout));
        process
            .write_frame(primer.as_bytes())
            .map_err(|e| MosaicError::SinkStart(e.to_string()))?;

        // A player without a usable display dies right away.
        let deadline = Instant::now() + self.settle;
        while Instant::now() < deadline {
            if let Some(status) = process.has_exited() {
                return Err(MosaicError::SinkStart(format!("player exited during startup: {status}")));
            }
            thread::sleep(Duration::from_millis(20));
        }
        tracing::info!(pid = process.pid(), "window open");

        Ok(SinkReady {
            artifact: None,
            pid: Some(process.pid()),
        })
    }
}

impl OutputSink for WindowSink {
    fn start(&mut self, primer: &CompositeFrame) -> Result<SinkReady> {
        if self.process.is_some() {
            return Err(MosaicError::SinkStart("window already open".to_string()));
        }
        if self.require_display && !display_available() {
            return Err(MosaicError::SinkStart("no display available".to_string()));
        }
        let result = self.launch(primer);
        if result.is_err() {
            self.stop();
        }
        result
    }

    fn push(&mut self, frame: &CompositeFrame) -> Result<PushOutcome> {
        let Some(process) = self.process.as_mut() else {
            return Err(MosaicError::SinkWrite("window not open".to_string()));
        };
        match process.write_frame(frame.as_bytes()) {
            Ok(()) => Ok(PushOutcome::Continue),
            Err(MosaicError::SinkCrashed(reason)) => {
                tracing::info!(%reason, "window closed by operator");
                Ok(PushOutcome::CloseRequested)
            }
            Err(e) => Err(e),
        }
    }

    fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate(self.stop_grace);
        }
    }
}

impl Drop for WindowSink {
    fn drop(&mut self) {
        self.stop();
    }
}
