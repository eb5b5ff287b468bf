//! Synthetic `pattern://RRGGBB` feeds.
//!
//! A pattern source emits one solid-colour frame per interval, forever. It
//! lets an operator check a mosaic or an output target without any network
//! feed, and it is what the tests pull from.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{MosaicError, Result};
use crate::media::{Frame, Rgb};

use super::{Canceller, Decoder, DecoderFactory, SourceSettings};

pub const PATTERN_SCHEME: &str = "pattern://";

/// Generates solid-colour frames for `pattern://` URLs.
#[derive(Debug, Clone)]
pub struct PatternDecoderFactory {
    pub interval: Duration,
}

impl Default for PatternDecoderFactory {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(40),
        }
    }
}

/// Parse the colour out of `pattern://RRGGBB` (leading `#` allowed).
pub fn parse_pattern(url: &str) -> Option<Rgb> {
    let hex = url.strip_prefix(PATTERN_SCHEME)?.trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([byte(0)?, byte(2)?, byte(4)?])
}

impl DecoderFactory for PatternDecoderFactory {
    fn open(&self, url: &str, width: u32, height: u32, settings: &SourceSettings) -> Result<Box<dyn Decoder>> {
        let color = parse_pattern(url)
            .ok_or_else(|| MosaicError::source_unavailable(url, "expected pattern://RRGGBB"))?;
        let frame = Frame::filled(width.max(1), height.max(1), color);
        Ok(Box::new(PatternDecoder {
            frame: settings.transform.apply(&frame),
            interval: self.interval,
            next_at: None,
        }))
    }

    fn supports(&self, url: &str) -> bool {
        parse_pattern(url).is_some()
    }
}

struct PatternDecoder {
    frame: Frame,
    interval: Duration,
    next_at: Option<Instant>,
}

impl Decoder for PatternDecoder {
    fn next_frame(&mut self) -> Result<Frame> {
        // First frame immediately, then one per interval.
        if let Some(at) = self.next_at {
            let now = Instant::now();
            if at > now {
                thread::sleep(at - now);
            }
        }
        self.next_at = Some(Instant::now() + self.interval);
        Ok(self.frame.clone())
    }

    fn canceller(&self) -> Canceller {
        Canceller::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::transform::FrameTransform;

    #[test]
    fn parses_hex_colours() {
        assert_eq!(parse_pattern("pattern://ff8000"), Some([255, 128, 0]));
        assert_eq!(parse_pattern("pattern://#00FF00"), Some([0, 255, 0]));
        assert_eq!(parse_pattern("pattern://red"), None);
        assert_eq!(parse_pattern("pattern://ff80"), None);
        assert_eq!(parse_pattern("rtp://ff8000"), None);
    }

    #[test]
    fn decoder_emits_frames_at_tile_size() {
        let factory = PatternDecoderFactory {
            interval: Duration::from_millis(1),
        };
        let mut decoder = factory
            .open("pattern://102030", 16, 9, &SourceSettings::default())
            .unwrap();
        let frame = decoder.next_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (16, 9));
        assert_eq!(frame.pixel(15, 8), Some([0x10, 0x20, 0x30]));
    }

    #[test]
    fn decoder_applies_rotation_and_trim() {
        let settings = SourceSettings {
            transform: FrameTransform::from_degrees(90, Some("0:0:100%:50%".parse().unwrap())),
            ..SourceSettings::default()
        };
        let mut decoder = PatternDecoderFactory::default()
            .open("pattern://102030", 16, 8, &settings)
            .unwrap();
        let frame = decoder.next_frame().unwrap();
        // 16x8 turned to 8x16, then the top half kept.
        assert_eq!((frame.width(), frame.height()), (8, 8));
    }
}
