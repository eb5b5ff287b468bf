use serde::Serialize;

use crate::media::Rect;

/// One grid cell, in row-major order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub index: usize,
    pub row: u32,
    pub col: u32,
    pub rect: Rect,
}

/// Grid geometry used to build one composite frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridLayout {
    pub rows: u32,
    pub cols: u32,
    pub cell_width: u32,
    pub cell_height: u32,
    pub cells: Vec<Cell>,
}

/// Choose `(rows, cols)` for `count` tiles.
///
/// Near-square: `cols = ceil(sqrt(n))`, `rows = ceil(n / cols)`. This never
/// yields more rows than columns; a portrait canvas gets the transpose.
///
/// ```text
/// n:     0    1    2    3    4    5    6    7    9    10
/// grid:  0x0  1x1  1x2  2x2  2x2  2x3  2x3  3x3  3x3  3x4   (rows x cols)
/// ```
pub fn grid_dimensions(count: usize, width: u32, height: u32) -> (u32, u32) {
    if count == 0 {
        return (0, 0);
    }
    let mut cols = 1usize;
    while cols * cols < count {
        cols += 1;
    }
    let rows = count.div_ceil(cols);
    let (rows, cols) = (rows as u32, cols as u32);
    if height > width {
        (cols, rows)
    } else {
        (rows, cols)
    }
}

/// Lay out `count` tiles on a `width × height` canvas.
///
/// Each cell is `width / cols × height / rows`; leftover pixels on the right
/// and bottom edges belong to no cell.
pub fn assign_grid(count: usize, width: u32, height: u32) -> GridLayout {
    let (rows, cols) = grid_dimensions(count, width, height);
    if count == 0 {
        return GridLayout {
            rows,
            cols,
            cell_width: 0,
            cell_height: 0,
            cells: Vec::new(),
        };
    }

    let cell_width = width / cols;
    let cell_height = height / rows;
    let cells = (0..count)
        .map(|index| {
            let row = index as u32 / cols;
            let col = index as u32 % cols;
            Cell {
                index,
                row,
                col,
                rect: Rect::new(col * cell_width, row * cell_height, cell_width, cell_height),
            }
        })
        .collect();

    GridLayout {
        rows,
        cols,
        cell_width,
        cell_height,
        cells,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_channels_on_720p_is_two_by_two() {
        let layout = assign_grid(4, 1280, 720);
        assert_eq!((layout.rows, layout.cols), (2, 2));
        assert_eq!((layout.cell_width, layout.cell_height), (640, 360));
        assert_eq!(layout.cells[3].rect, Rect::new(640, 360, 640, 360));
    }

    #[test]
    fn zero_channels_has_no_cells() {
        let layout = assign_grid(0, 1280, 720);
        assert_eq!((layout.rows, layout.cols), (0, 0));
        assert!(layout.cells.is_empty());
    }

    #[test]
    fn ties_prefer_more_columns_on_landscape() {
        assert_eq!(grid_dimensions(2, 1280, 720), (1, 2));
        assert_eq!(grid_dimensions(5, 1280, 720), (2, 3));
        assert_eq!(grid_dimensions(6, 1920, 1080), (2, 3));
        assert_eq!(grid_dimensions(10, 1920, 1080), (3, 4));
    }

    #[test]
    fn portrait_canvas_transposes() {
        assert_eq!(grid_dimensions(2, 720, 1280), (2, 1));
        assert_eq!(grid_dimensions(5, 720, 1280), (3, 2));
    }

    #[test]
    fn grid_always_fits_and_is_near_square() {
        for n in 1..=64 {
            let (rows, cols) = grid_dimensions(n, 1280, 720);
            assert!((rows * cols) as usize >= n, "n={n}");
            assert!(rows <= cols, "n={n}");
            // Dropping a row or a column would no longer fit.
            assert!(((rows - 1) * cols) < n as u32, "n={n}");
        }
    }

    #[test]
    fn cells_stay_inside_canvas() {
        for n in 1..=17 {
            let layout = assign_grid(n, 1000, 700);
            for cell in &layout.cells {
                assert!(cell.rect.right() <= 1000);
                assert!(cell.rect.bottom() <= 700);
            }
        }
    }
}
