//! Network feeds decoded by an `ffmpeg` child process.
//!
//! The child reads the source URL and writes fixed-size raw RGB24 frames to
//! stdout, already rotated, trimmed, scaled and padded to the tile size:
//!
//! ```text
//! ffmpeg -hide_banner -loglevel error [-key value]... -i URL \
//!        -an -vf [transpose,crop,]scale=W:H:force_original_aspect_ratio=decrease,pad=W:H:(ow-iw)/2:(oh-ih)/2 \
//!        -f rawvideo -pix_fmt rgb24 -
//! ```
//!
//! The decoder's [`Canceller`] kills the child, which makes a read blocked
//! on a frozen feed return immediately.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{MosaicError, Result};
use crate::media::Frame;

use super::{Canceller, Decoder, DecoderFactory, SourceSettings};

/// Spawns one ffmpeg decoder per connection attempt.
#[derive(Debug, Clone)]
pub struct FfmpegDecoderFactory {
    pub program: String,
}

impl Default for FfmpegDecoderFactory {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
        }
    }
}

impl FfmpegDecoderFactory {
    /// Command-line arguments for decoding `url` into `width × height` frames.
    pub fn args(&self, url: &str, width: u32, height: u32, settings: &SourceSettings) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for (key, value) in &settings.input_options {
            args.push(format!("-{key}"));
            args.push(value.clone());
        }
        let mut filters = settings.transform.ffmpeg_filters();
        filters.push(format!(
            "scale={width}:{height}:force_original_aspect_ratio=decrease,\
             pad={width}:{height}:(ow-iw)/2:(oh-ih)/2"
        ));
        args.extend([
            "-i".to_string(),
            url.to_string(),
            "-an".to_string(),
            "-vf".to_string(),
            filters.join(","),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgb24".to_string(),
            "-".to_string(),
        ]);
        args
    }
}

impl DecoderFactory for FfmpegDecoderFactory {
    fn open(&self, url: &str, width: u32, height: u32, settings: &SourceSettings) -> Result<Box<dyn Decoder>> {
        let mut child = Command::new(&self.program)
            .args(self.args(url, width, height, settings))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MosaicError::source_unavailable(url, format!("{}: {e}", self.program)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MosaicError::source_unavailable(url, "decoder stdout unavailable"))?;
        tracing::debug!(%url, pid = child.id(), "decoder spawned");

        Ok(Box::new(FfmpegDecoder {
            url: url.to_string(),
            width,
            height,
            stdout,
            child: Arc::new(Mutex::new(child)),
        }))
    }
}

struct FfmpegDecoder {
    url: String,
    width: u32,
    height: u32,
    stdout: ChildStdout,
    child: Arc<Mutex<Child>>,
}

impl Decoder for FfmpegDecoder {
    fn next_frame(&mut self) -> Result<Frame> {
        let mut buf = vec![0u8; Frame::byte_len(self.width, self.height)];
        self.stdout
            .read_exact(&mut buf)
            .map_err(|e| MosaicError::source_unavailable(&self.url, e))?;
        Frame::from_rgb24(self.width, self.height, buf)
    }

    fn canceller(&self) -> Canceller {
        let child = self.child.clone();
        Canceller::new(move || {
            let _ = child.lock().kill();
        })
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
    }
}
