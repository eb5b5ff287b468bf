//! RTP output through an encoder subprocess.
//!
//! ```text
//! live loop ──rgb24──► encoder stdin ──H.264/RTP──► rtp://host:port
//!                          │
//!                          └─► <scratch>/encoder.sdp ──rewrite──► <scratch>/mosaic.sdp
//! ```
//!
//! The published `mosaic.sdp` only exists once the encoder has written its
//! own description, so nobody can fetch an SDP for a stream that is not
//! flowing yet.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::compositor::CompositeFrame;
use crate::error::{MosaicError, Result};
use crate::session::target::OutputTarget;

use super::process::{self, ManagedProcess};
use super::{EncoderSettings, OutputSink, PushOutcome, SessionArtifact, SinkContext, SinkReady, sdp};

/// SDP file the encoder writes.
pub const ENCODER_SDP: &str = "encoder.sdp";
/// SDP file served to viewers.
pub const PUBLISHED_SDP: &str = "mosaic.sdp";

pub struct RtpSink {
    program: String,
    args: Vec<String>,
    fps: u32,
    startup_timeout: Duration,
    stop_grace: Duration,
    write_timeout: Duration,
    scratch_dir: PathBuf,
    title: String,
    process: Option<ManagedProcess>,
}

impl RtpSink {
    pub fn new(settings: &EncoderSettings, target: &OutputTarget, dest: String, context: SinkContext) -> Self {
        let raw_sdp = context.scratch_dir.join(ENCODER_SDP);
        let args = process::expand(
            &settings.rtp_args,
            &[
                ("width", context.width.to_string()),
                ("height", context.height.to_string()),
                ("fps", target.fps.to_string()),
                ("dest", dest),
                ("sdp", raw_sdp.display().to_string()),
                ("dir", context.scratch_dir.display().to_string()),
                ("title", context.title.clone()),
            ],
            &settings.merged_options(target),
        );
        Self {
            program: settings.encoder_program.clone(),
            args,
            fps: target.fps,
            startup_timeout: settings.rtp_startup_timeout,
            stop_grace: settings.stop_grace,
            write_timeout: settings.write_timeout,
            scratch_dir: context.scratch_dir,
            title: context.title,
            process: None,
        }
    }

    pub fn sdp_path(&self) -> PathBuf {
        self.scratch_dir.join(PUBLISHED_SDP)
    }

    fn launch(&mut self, primer: &CompositeFrame) -> Result<SinkReady> {
        let raw_path = self.scratch_dir.join(ENCODER_SDP);
        let sdp_path = self.sdp_path();
        let process = self.process.insert(ManagedProcess::spawn(
            "rtp encoder",
            &self.program,
            &self.args,
            Some(&self.scratch_dir),
        )?
        .with_write_timeout(self.write_timeout));

        let raw = process::prime(
            process,
            primer.as_bytes(),
            self.fps,
            self.startup_timeout,
            || {
                fs::read_to_string(&raw_path)
                    .ok()
                    .filter(|raw| sdp::is_complete(raw))
            },
        )?;

        fs::write(&sdp_path, sdp::publish_sdp(&raw, &self.title))
            .map_err(|e| MosaicError::SinkStart(format!("cannot write {}: {e}", sdp_path.display())))?;
        tracing::info!(pid = process.pid(), sdp = %sdp_path.display(), "rtp output ready");

        Ok(SinkReady {
            artifact: Some(SessionArtifact::Sdp(sdp_path)),
            pid: Some(process.pid()),
        })
    }
}

impl OutputSink for RtpSink {
    fn start(&mut self, primer: &CompositeFrame) -> Result<SinkReady> {
        if self.process.is_some() {
            return Err(MosaicError::SinkStart("rtp sink already started".to_string()));
        }
        super::create_scratch(&self.scratch_dir)?;
        let result = self.launch(primer);
        if result.is_err() {
            self.stop();
        }
        result
    }

    fn push(&mut self, frame: &CompositeFrame) -> Result<PushOutcome> {
        process::push_to_encoder(self.process.as_mut(), frame.as_bytes())
    }

    fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate(self.stop_grace);
        }
        super::remove_scratch(&self.scratch_dir);
    }
}

impl Drop for RtpSink {
    fn drop(&mut self) {
        self.stop();
    }
}
