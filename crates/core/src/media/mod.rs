//! Raw video frames and the raster operations the compositor needs.
//!
//! Frames are packed RGB24: three bytes per pixel, rows top to bottom, no
//! stride padding. This is what decoders emit on stdout and what encoders
//! read on stdin (`-f rawvideo -pix_fmt rgb24`), so a frame crosses the
//! process boundary without conversion.
//!
//! All drawing operations clip to the frame bounds; callers never need to
//! pre-clip rectangles or text positions.

pub mod font;
pub mod transform;

use crate::error::{MosaicError, Result};

/// An RGB colour.
pub type Rgb = [u8; 3];

/// Bytes per RGB24 pixel.
pub const BYTES_PER_PIXEL: usize = 3;

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Shrink by `by` pixels on every side, never below zero size.
    pub fn inset(&self, by: u32) -> Rect {
        let dx = by.min(self.width / 2);
        let dy = by.min(self.height / 2);
        Rect::new(
            self.x + dx,
            self.y + dy,
            self.width - 2 * dx,
            self.height - 2 * dy,
        )
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A decoded RGB24 picture.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// A frame of one solid colour.
    pub fn filled(width: u32, height: u32, color: Rgb) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * BYTES_PER_PIXEL);
        for _ in 0..pixels {
            data.extend_from_slice(&color);
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Wrap raw RGB24 bytes. The buffer length must match the dimensions.
    pub fn from_rgb24(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = Self::byte_len(width, height);
        if data.len() != expected {
            return Err(MosaicError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "frame buffer is {} bytes, expected {expected} for {width}x{height}",
                    data.len()
                ),
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Size in bytes of an RGB24 frame with these dimensions.
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Packed RGB24 bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL
    }

    /// Colour at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = self.offset(x, y);
        Some([self.data[at], self.data[at + 1], self.data[at + 2]])
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, color: Rgb) {
        if x < self.width && y < self.height {
            let at = self.offset(x, y);
            self.data[at..at + BYTES_PER_PIXEL].copy_from_slice(&color);
        }
    }

    fn clip(&self, rect: Rect) -> Rect {
        let x = rect.x.min(self.width);
        let y = rect.y.min(self.height);
        let right = rect.right().min(self.width);
        let bottom = rect.bottom().min(self.height);
        Rect::new(x, y, right - x, bottom - y)
    }

    pub fn fill_rect(&mut self, rect: Rect, color: Rgb) {
        let rect = self.clip(rect);
        for y in rect.y..rect.bottom() {
            let start = self.offset(rect.x, y);
            let end = self.offset(rect.right(), y);
            for px in self.data[start..end].chunks_exact_mut(BYTES_PER_PIXEL) {
                px.copy_from_slice(&color);
            }
        }
    }

    /// Draw a rectangle outline `thickness` pixels wide, inside `rect`.
    pub fn stroke_rect(&mut self, rect: Rect, thickness: u32, color: Rgb) {
        let t = thickness.min(rect.width / 2).min(rect.height / 2).max(1);
        self.fill_rect(Rect::new(rect.x, rect.y, rect.width, t), color);
        self.fill_rect(
            Rect::new(rect.x, rect.bottom().saturating_sub(t), rect.width, t),
            color,
        );
        self.fill_rect(Rect::new(rect.x, rect.y, t, rect.height), color);
        self.fill_rect(
            Rect::new(rect.right().saturating_sub(t), rect.y, t, rect.height),
            color,
        );
    }

    /// Blend `color` over `rect` with the given opacity (0.0 – 1.0).
    pub fn blend_rect(&mut self, rect: Rect, color: Rgb, alpha: f32) {
        let rect = self.clip(rect);
        let alpha = alpha.clamp(0.0, 1.0);
        for y in rect.y..rect.bottom() {
            let start = self.offset(rect.x, y);
            let end = self.offset(rect.right(), y);
            for px in self.data[start..end].chunks_exact_mut(BYTES_PER_PIXEL) {
                for (channel, over) in px.iter_mut().zip(color) {
                    let mixed = over as f32 * alpha + *channel as f32 * (1.0 - alpha);
                    *channel = mixed.round() as u8;
                }
            }
        }
    }

    /// Scale `src` into `dest` preserving aspect ratio (nearest neighbour),
    /// letterboxing the rest of `dest` with `background`.
    pub fn blit_fit(&mut self, src: &Frame, dest: Rect, background: Rgb) {
        self.fill_rect(dest, background);
        if dest.is_empty() || src.width == 0 || src.height == 0 {
            return;
        }
        let fitted = fit_within(src.width, src.height, dest.width, dest.height);
        let x0 = dest.x + (dest.width - fitted.0) / 2;
        let y0 = dest.y + (dest.height - fitted.1) / 2;
        let target = self.clip(Rect::new(x0, y0, fitted.0, fitted.1));

        for y in target.y..target.bottom() {
            let sy = ((y - y0) as u64 * src.height as u64 / fitted.1 as u64) as u32;
            for x in target.x..target.right() {
                let sx = ((x - x0) as u64 * src.width as u64 / fitted.0 as u64) as u32;
                let from = src.offset(sx, sy);
                let to = self.offset(x, y);
                self.data[to..to + BYTES_PER_PIXEL]
                    .copy_from_slice(&src.data[from..from + BYTES_PER_PIXEL]);
            }
        }
    }

    /// Copy of the pixels inside `rect`, clipped to the frame.
    pub fn crop(&self, rect: Rect) -> Frame {
        let rect = self.clip(rect);
        let mut data = Vec::with_capacity(Self::byte_len(rect.width, rect.height));
        for y in rect.y..rect.bottom() {
            data.extend_from_slice(&self.data[self.offset(rect.x, y)..self.offset(rect.right(), y)]);
        }
        Frame {
            width: rect.width,
            height: rect.height,
            data,
        }
    }

    /// Rotate counter-clockwise by `quarter_turns` × 90°.
    pub fn rotate_ccw(&self, quarter_turns: u8) -> Frame {
        let turns = quarter_turns % 4;
        if turns == 0 {
            return self.clone();
        }
        let (w, h) = (self.width, self.height);
        let (out_w, out_h) = if turns == 2 { (w, h) } else { (h, w) };
        let mut out = Frame::filled(out_w, out_h, [0, 0, 0]);
        for y in 0..h {
            for x in 0..w {
                let (nx, ny) = match turns {
                    1 => (y, w - 1 - x),
                    2 => (w - 1 - x, h - 1 - y),
                    _ => (h - 1 - y, x),
                };
                let from = self.offset(x, y);
                let to = out.offset(nx, ny);
                out.data[to..to + BYTES_PER_PIXEL]
                    .copy_from_slice(&self.data[from..from + BYTES_PER_PIXEL]);
            }
        }
        out
    }

    /// Binary PPM (P6) encoding, for snapshots.
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.data);
        out
    }
}

/// Largest `(w, h)` with the source aspect ratio that fits the box.
fn fit_within(src_w: u32, src_h: u32, box_w: u32, box_h: u32) -> (u32, u32) {
    // Compare src_w/src_h against box_w/box_h without floating point.
    if src_w as u64 * box_h as u64 >= box_w as u64 * src_h as u64 {
        let h = (box_w as u64 * src_h as u64 / src_w as u64) as u32;
        (box_w, h.clamp(1, box_h))
    } else {
        let w = (box_h as u64 * src_w as u64 / src_h as u64) as u32;
        (w.clamp(1, box_w), box_h)
    }
}
