//! Per-channel picture adjustment: rotate, then trim.
//!
//! Registry rows may carry a `rotation` in degrees (counter-clockwise,
//! snapped down to a multiple of 90) and a `trim` of the form `x:y:w:h`,
//! where `w` and `h` may be percentages of the rotated picture:
//!
//! ```text
//! rotation,trim
//! 90,
//! 0,0:0:50%:100%
//! 180,100:40:640:360
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::{Frame, Rect};

/// Width or height of a trim window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimSize {
    Pixels(u32),
    Percent(f32),
}

impl TrimSize {
    fn resolve(self, total: u32) -> u32 {
        match self {
            Self::Pixels(px) => px,
            Self::Percent(pct) => ((total as f64 * pct as f64 / 100.0) as u32).max(1),
        }
    }

    fn ffmpeg_expr(self, total_var: &str) -> String {
        match self {
            Self::Pixels(px) => px.to_string(),
            Self::Percent(pct) => format!("max(1,trunc({total_var}*{}))", pct as f64 / 100.0),
        }
    }
}

impl FromStr for TrimSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        let s = s.trim();
        match s.strip_suffix('%') {
            Some(pct) => match pct.trim().parse::<f32>() {
                Ok(v) if v.is_finite() && v > 0.0 => Ok(Self::Percent(v)),
                _ => Err(format!("bad percentage '{s}'")),
            },
            None => s.parse().map(Self::Pixels).map_err(|_| format!("bad size '{s}'")),
        }
    }
}

/// Window `x:y:w:h` cut out of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trim {
    pub x: u32,
    pub y: u32,
    pub width: TrimSize,
    pub height: TrimSize,
}

impl Trim {
    /// Pixel rectangle for a `width × height` picture.
    ///
    /// The window is clamped to the picture. `None` when nothing of it
    /// remains, in which case the picture is used untrimmed.
    pub fn resolve(&self, width: u32, height: u32) -> Option<Rect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.resolve(width).min(width - self.x);
        let h = self.height.resolve(height).min(height - self.y);
        let rect = Rect::new(self.x, self.y, w, h);
        (!rect.is_empty()).then_some(rect)
    }
}

impl FromStr for Trim {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split(':').collect();
        let [x, y, w, h] = parts.as_slice() else {
            return Err(format!("trim '{s}' is not x:y:w:h"));
        };
        // Negative offsets count from the edge like zero does.
        let offset = |v: &str| {
            v.trim()
                .parse::<i64>()
                .map(|n| n.clamp(0, u32::MAX as i64) as u32)
                .map_err(|_| format!("bad offset '{v}'"))
        };
        Ok(Self {
            x: offset(x)?,
            y: offset(y)?,
            width: w.parse()?,
            height: h.parse()?,
        })
    }
}

impl fmt::Display for Trim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = |s: TrimSize| match s {
            TrimSize::Pixels(px) => px.to_string(),
            TrimSize::Percent(pct) => format!("{pct}%"),
        };
        write!(f, "{}:{}:{}:{}", self.x, self.y, size(self.width), size(self.height))
    }
}

/// Rotation followed by an optional trim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTransform {
    /// Counter-clockwise quarter turns, `0..4`.
    pub quarter_turns: u8,
    pub trim: Option<Trim>,
}

impl FrameTransform {
    /// Snap `degrees` down to a multiple of 90.
    pub fn from_degrees(degrees: i64, trim: Option<Trim>) -> Self {
        Self {
            quarter_turns: degrees.div_euclid(90).rem_euclid(4) as u8,
            trim,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.quarter_turns == 0 && self.trim.is_none()
    }

    pub fn apply(&self, frame: &Frame) -> Frame {
        let rotated = frame.rotate_ccw(self.quarter_turns);
        match self
            .trim
            .and_then(|t| t.resolve(rotated.width(), rotated.height()))
        {
            Some(rect) => rotated.crop(rect),
            None => rotated,
        }
    }

    /// The same adjustment as an ffmpeg filter chain, in source pixels.
    /// Empty for the identity.
    pub fn ffmpeg_filters(&self) -> Vec<String> {
        let mut filters = Vec::new();
        match self.quarter_turns {
            1 => filters.push("transpose=cclock".to_string()),
            2 => filters.extend(["hflip".to_string(), "vflip".to_string()]),
            3 => filters.push("transpose=clock".to_string()),
            _ => {}
        }
        if let Some(trim) = self.trim {
            filters.push(format!(
                "crop=w='min({},iw-{x})':h='min({},ih-{y})':x={x}:y={y}",
                trim.width.ffmpeg_expr("iw"),
                trim.height.ffmpeg_expr("ih"),
                x = trim.x,
                y = trim.y,
            ));
        }
        filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pixel_and_percent_trims() {
        let trim: Trim = "10:20:50%:100".parse().unwrap();
        assert_eq!(trim.x, 10);
        assert_eq!(trim.y, 20);
        assert_eq!(trim.width, TrimSize::Percent(50.0));
        assert_eq!(trim.height, TrimSize::Pixels(100));
        assert_eq!(trim.to_string(), "10:20:50%:100");

        assert!("1:2:3".parse::<Trim>().is_err());
        assert!("a:0:1:1".parse::<Trim>().is_err());
        assert!("0:0:0%:1".parse::<Trim>().is_err());
        assert_eq!("-5:0:1:1".parse::<Trim>().unwrap().x, 0);
    }

    #[test]
    fn percent_trim_resolves_against_picture() {
        let trim: Trim = "0:0:50%:25%".parse().unwrap();
        assert_eq!(trim.resolve(640, 360), Some(Rect::new(0, 0, 320, 90)));
        // Never collapses to nothing.
        let tiny: Trim = "0:0:1%:1%".parse().unwrap();
        assert_eq!(tiny.resolve(10, 10), Some(Rect::new(0, 0, 1, 1)));
    }

    #[test]
    fn trim_is_clamped_to_picture() {
        let trim: Trim = "600:300:100:100".parse().unwrap();
        assert_eq!(trim.resolve(640, 360), Some(Rect::new(600, 300, 40, 60)));
        let outside: Trim = "700:0:10:10".parse().unwrap();
        assert_eq!(outside.resolve(640, 360), None);
    }

    #[test]
    fn degrees_snap_to_quarter_turns() {
        assert_eq!(FrameTransform::from_degrees(90, None).quarter_turns, 1);
        assert_eq!(FrameTransform::from_degrees(135, None).quarter_turns, 1);
        assert_eq!(FrameTransform::from_degrees(270, None).quarter_turns, 3);
        assert_eq!(FrameTransform::from_degrees(360, None).quarter_turns, 0);
        assert_eq!(FrameTransform::from_degrees(-90, None).quarter_turns, 3);
        assert!(FrameTransform::from_degrees(45, None).is_identity());
    }

    #[test]
    fn trim_applies_after_rotation() {
        // 4x2: left half red, right half blue.
        let mut frame = Frame::filled(4, 2, [255, 0, 0]);
        frame.fill_rect(Rect::new(2, 0, 2, 2), [0, 0, 255]);

        // A quarter turn puts the blue half on top; keep the top half.
        let transform = FrameTransform::from_degrees(90, Some("0:0:100%:50%".parse().unwrap()));
        let out = transform.apply(&frame);
        assert_eq!((out.width(), out.height()), (2, 2));
        assert_eq!(out.pixel(0, 0), Some([0, 0, 255]));
        assert_eq!(out.pixel(1, 1), Some([0, 0, 255]));
    }

    #[test]
    fn ffmpeg_chain_rotates_then_crops() {
        let transform = FrameTransform::from_degrees(90, Some("10:0:50%:100".parse().unwrap()));
        assert_eq!(
            transform.ffmpeg_filters(),
            vec![
                "transpose=cclock".to_string(),
                "crop=w='min(max(1,trunc(iw*0.5)),iw-10)':h='min(100,ih-0)':x=10:y=0".to_string(),
            ]
        );
        assert!(FrameTransform::default().ffmpeg_filters().is_empty());
    }
}
