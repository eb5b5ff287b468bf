//! Mosaic compositor: tiles named frames onto one labelled canvas.
//!
//! ```text
//! +------------------+------------------+
//! |   CAM1 (fresh)   |  CAM2 (stale)    |
//! |   [ picture ]    |  [ last frame ]  |  stale: placeholder-coloured border
//! |▮CAM1             |▮■ CAM2           |  degraded: placeholder box before name
//! +------------------+------------------+
//! |   CAM3 (absent)  |  CAM4 (failed)   |
//! |       ...        |    NO SIGNAL     |
//! |▮■ CAM3           |▮■ CAM4           |
//! +------------------+------------------+
//! ```
//!
//! [`compose`] is a pure function of its inputs: the same frames and the same
//! [`CompositorConfig`] always produce the same pixels, and the output is
//! always exactly `width × height`.

pub mod layout;


pub use layout::{Cell, GridLayout, assign_grid, grid_dimensions};

use crate::media::font::{self, draw_text, text_height, text_width};
use crate::media::{Frame, Rect, Rgb};
use crate::source::SourceFrame;

pub const BACKGROUND: Rgb = [16, 16, 16];
pub const LIGHT_GREY: Rgb = [68, 68, 68];
pub const DARK_GREY: Rgb = [48, 48, 48];
pub const TEXT_COLOR: Rgb = [230, 230, 230];
pub const PLACEHOLDER_COLOR: Rgb = [247, 227, 101];
pub const FAILURE_COLOR: Rgb = [230, 40, 40];

/// Caption drawn on an empty mosaic.
pub const NO_CHANNELS: &str = "no channels";

const LABEL_BAR_ALPHA: f32 = 0.8;
const LABEL_MARGIN: u32 = 8;

/// Canvas and label settings for the compositor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositorConfig {
    pub width: u32,
    pub height: u32,
    /// Nominal label height in pixels.
    pub label_font_size: u32,
    /// Inset of the picture inside each cell.
    pub padding: u32,
    pub background: Rgb,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            label_font_size: 28,
            padding: 8,
            background: BACKGROUND,
        }
    }
}

impl CompositorConfig {
    /// Picture area each source should decode to for `count` channels.
    pub fn tile_size(&self, count: usize) -> (u32, u32) {
        let layout = assign_grid(count.max(1), self.width, self.height);
        let inner = Rect::new(0, 0, layout.cell_width, layout.cell_height).inset(self.padding);
        (inner.width.max(2) & !1, inner.height.max(2) & !1)
    }
}

/// One frame of mosaic output.
#[derive(Debug, Clone)]
pub struct CompositeFrame {
    pub frame: Frame,
    pub layout: GridLayout,
    /// Channel name per cell, same order as `layout.cells`.
    pub labels: Vec<String>,
    /// Banner text for a mosaic without cells.
    pub caption: Option<String>,
}

impl CompositeFrame {
    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    /// Raw RGB24 bytes, as written to encoder stdin.
    pub fn as_bytes(&self) -> &[u8] {
        self.frame.data()
    }
}

/// Build one composite frame from named source frames, in tile order.
pub fn compose(inputs: &[(String, SourceFrame)], config: &CompositorConfig) -> CompositeFrame {
    let mut canvas = Frame::filled(config.width, config.height, config.background);
    let layout = assign_grid(inputs.len(), config.width, config.height);
    let scale = font::scale_for(config.label_font_size);

    if inputs.is_empty() {
        let text = NO_CHANNELS.to_uppercase();
        let x = config.width.saturating_sub(text_width(&text, scale)) / 2;
        let y = config.height.saturating_sub(text_height(scale)) / 2;
        let bounds = canvas.bounds();
        draw_text(&mut canvas, &text, x, y, scale, TEXT_COLOR, bounds);
        return CompositeFrame {
            frame: canvas,
            layout,
            labels: Vec::new(),
            caption: Some(NO_CHANNELS.to_string()),
        };
    }

    for (cell, (name, input)) in layout.cells.iter().zip(inputs) {
        draw_tile(&mut canvas, cell, input, config, scale);
        draw_label(&mut canvas, cell.rect, name, input.is_degraded(), scale);
    }

    CompositeFrame {
        frame: canvas,
        layout,
        labels: inputs.iter().map(|(name, _)| name.clone()).collect(),
        caption: None,
    }
}

/// A mosaic with every channel shown as a placeholder, before any source
/// has delivered a frame. Also used to prime encoders.
pub fn placeholder(names: &[String], config: &CompositorConfig) -> CompositeFrame {
    let inputs: Vec<_> = names
        .iter()
        .map(|name| (name.clone(), SourceFrame::Absent))
        .collect();
    compose(&inputs, config)
}

fn draw_tile(canvas: &mut Frame, cell: &Cell, input: &SourceFrame, config: &CompositorConfig, scale: u32) {
    let inner = cell.rect.inset(config.padding);
    match input {
        SourceFrame::Fresh(frame) => canvas.blit_fit(frame, inner, config.background),
        SourceFrame::Stale(frame) => {
            canvas.blit_fit(frame, inner, config.background);
            canvas.stroke_rect(inner, scale.max(2), PLACEHOLDER_COLOR);
        }
        SourceFrame::Absent => {
            let fill = if (cell.row + cell.col) % 2 == 0 {
                LIGHT_GREY
            } else {
                DARK_GREY
            };
            canvas.fill_rect(inner, fill);
            draw_centered(canvas, inner, "...", scale, PLACEHOLDER_COLOR);
        }
        SourceFrame::Failed => {
            canvas.fill_rect(inner, DARK_GREY);
            draw_centered(canvas, inner, "NO SIGNAL", scale, FAILURE_COLOR);
        }
    }
}

fn draw_centered(canvas: &mut Frame, area: Rect, text: &str, scale: u32, color: Rgb) {
    let x = area.x + area.width.saturating_sub(text_width(text, scale)) / 2;
    let y = area.y + area.height.saturating_sub(text_height(scale)) / 2;
    draw_text(canvas, text, x, y, scale, color, area);
}

/// Bottom-left label on a darkened bar spanning the cell width.
fn draw_label(canvas: &mut Frame, cell: Rect, name: &str, degraded: bool, scale: u32) {
    let glyph_h = text_height(scale);
    let bar_h = (glyph_h + 2 * scale + 4).min(cell.height);
    let bar = Rect::new(cell.x, cell.bottom() - bar_h, cell.width, bar_h);
    canvas.blend_rect(bar, [0, 0, 0], LABEL_BAR_ALPHA);

    let text_y = bar.y + bar_h.saturating_sub(glyph_h) / 2;
    let mut text_x = cell.x + LABEL_MARGIN.min(cell.width / 4);
    if degraded {
        let marker = Rect::new(text_x, text_y, glyph_h, glyph_h);
        canvas.stroke_rect(marker, scale, PLACEHOLDER_COLOR);
        text_x += glyph_h + (font::GLYPH_WIDTH + 1) * scale / 2;
    }
    draw_text(canvas, name, text_x, text_y, scale, TEXT_COLOR, bar);
}
