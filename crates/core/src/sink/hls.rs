//! HLS output: a rolling playlist under the session scratch directory.
//!
//! ```text
//! <scratch>/index.m3u8
//! <scratch>/seg_000.ts
//! <scratch>/seg_001.ts ...
//! ```
//!
//! Start succeeds only after the encoder has written a playlist, so a
//! session never advertises a manifest that does not exist.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::compositor::CompositeFrame;
use crate::error::{MosaicError, Result};
use crate::session::target::OutputTarget;

use super::process::{self, ManagedProcess};
use super::{EncoderSettings, OutputSink, PushOutcome, SessionArtifact, SinkContext, SinkReady};

pub const PLAYLIST: &str = "index.m3u8";
pub const SEGMENT_PATTERN: &str = "seg_%03d.ts";

/// Whether `text` is the start of a usable playlist.
pub fn is_playlist(text: &str) -> bool {
    text.starts_with("#EXTM3U")
}

pub struct HlsSink {
    program: String,
    args: Vec<String>,
    fps: u32,
    startup_timeout: Duration,
    stop_grace: Duration,
    write_timeout: Duration,
    scratch_dir: PathBuf,
    process: Option<ManagedProcess>,
}

impl HlsSink {
    pub fn new(settings: &EncoderSettings, target: &OutputTarget, context: SinkContext) -> Self {
        let dir = &context.scratch_dir;
        let args = process::expand(
            &settings.hls_args,
            &[
                ("width", context.width.to_string()),
                ("height", context.height.to_string()),
                ("fps", target.fps.to_string()),
                ("dir", dir.display().to_string()),
                ("playlist", dir.join(PLAYLIST).display().to_string()),
                ("segment", dir.join(SEGMENT_PATTERN).display().to_string()),
                ("hls_time", settings.hls_time.to_string()),
                ("hls_list_size", settings.hls_list_size.to_string()),
                ("title", context.title.clone()),
            ],
            &settings.merged_options(target),
        );
        Self {
            program: settings.encoder_program.clone(),
            args,
            fps: target.fps,
            startup_timeout: settings.hls_startup_timeout,
            stop_grace: settings.stop_grace,
            write_timeout: settings.write_timeout,
            scratch_dir: context.scratch_dir,
            process: None,
        }
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.scratch_dir.join(PLAYLIST)
    }

    fn launch(&mut self, primer: &CompositeFrame) -> Result<SinkReady> {
        let playlist = self.playlist_path();
        let process = self.process.insert(ManagedProcess::spawn(
            "hls encoder",
            &self.program,
            &self.args,
            Some(&self.scratch_dir),
        )?
        .with_write_timeout(self.write_timeout));

        process::prime(
            process,
            primer.as_bytes(),
            self.fps,
            self.startup_timeout,
            || {
                fs::read_to_string(&playlist)
                    .ok()
                    .filter(|text| is_playlist(text))
                    .map(|_| ())
            },
        )?;
        tracing::info!(pid = process.pid(), playlist = %playlist.display(), "hls output ready");

        Ok(SinkReady {
            artifact: Some(SessionArtifact::Playlist(playlist)),
            pid: Some(process.pid()),
        })
    }
}

impl OutputSink for HlsSink {
    fn start(&mut self, primer: &CompositeFrame) -> Result<SinkReady> {
        if self.process.is_some() {
            return Err(MosaicError::SinkStart("hls sink already started".to_string()));
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

impl Drop for HlsSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::compositor::{CompositorConfig, placeholder};

    fn settings(script: &str) -> EncoderSettings {
        EncoderSettings {
            encoder_program: "sh".to_string(),
            hls_args: vec![
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
                "{playlist}".to_string(),
                "{segment}".to_string(),
            ],
            hls_startup_timeout: Duration::from_millis(400),
            stop_grace: Duration::from_millis(500),
            ..EncoderSettings::default()
        }
    }

    fn primer() -> CompositeFrame {
        let config = CompositorConfig {
            width: 32,
            height: 18,
            ..CompositorConfig::default()
        };
        placeholder(&[], &config)
    }

    fn sink(settings: &EncoderSettings, scratch: PathBuf) -> HlsSink {
        let target = OutputTarget::hls("lobby").unwrap();
        let context = SinkContext {
            scratch_dir: scratch,
            width: 32,
            height: 18,
            title: "lobby".to_string(),
        };
        HlsSink::new(settings, &target, context)
    }

    #[test]
    fn ready_once_playlist_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("hls");
        let settings = settings("printf '#EXTM3U\\n' > \"$1\"; exec cat > /dev/null");
        let mut sink = sink(&settings, scratch.clone());

        let ready = sink.start(&primer()).unwrap();
        assert_eq!(
            ready.artifact,
            Some(SessionArtifact::Playlist(scratch.join(PLAYLIST)))
        );
        assert!(sink.push(&primer()).is_ok());
        sink.stop();
        assert!(!scratch.exists());
    }

    #[test]
    fn segment_placeholder_expands_under_scratch() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("hls");
        let sink = sink(&settings("true"), scratch.clone());
        let segment = scratch.join(SEGMENT_PATTERN).display().to_string();
        assert!(sink.args.contains(&segment));
    }

    #[test]
    fn no_playlist_fails_without_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("hls");
        // Writes something that is not a playlist.
        let settings = settings("echo garbage > \"$1\"; exec cat > /dev/null");
        let mut sink = sink(&settings, scratch.clone());

        assert!(matches!(
            sink.start(&primer()),
            Err(MosaicError::StartupTimeout(_))
        ));
        assert!(!scratch.exists());
    }

    #[test]
    fn encoder_that_never_reads_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("hls");
        let settings = EncoderSettings {
            hls_startup_timeout: Duration::from_millis(300),
            stop_grace: Duration::from_millis(200),
            ..settings("exec sleep 30")
        };
        let mut sink = sink(&settings, scratch.clone());
        // One 1280x720 primer overfills the pipe.
        let primer = placeholder(&[], &CompositorConfig::default());

        let started = std::time::Instant::now();
        let result = sink.start(&primer);
        assert!(matches!(result, Err(MosaicError::StartupTimeout(_))), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(sink.process.is_none());
        assert!(!scratch.exists());
    }

    #[test]
    fn push_before_start_is_a_write_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = sink(&settings("true"), tmp.path().join("hls"));
        assert!(matches!(sink.push(&primer()), Err(MosaicError::SinkWrite(_))));
    }

    #[test]
    fn playlist_detection() {
        assert!(is_playlist("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(!is_playlist(""));
        assert!(!is_playlist("garbage"));
    }
}
