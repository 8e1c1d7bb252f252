// ============================================================================
// GRID TRANSPOSE — swap rows and columns of the remote canvas
// ============================================================================

use std::collections::HashMap;

use crate::grid::PixelId;
use crate::remote::{PixelMutation, RemotePixel};

/// Dense `rows × cols` container; `None` marks a cell with no record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DenseGrid<T> {
    rows: usize,
    cols: usize,
    cells: Vec<Option<T>>,
}

impl<T: Clone> DenseGrid<T> {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols, cells: vec![None; rows * cols] }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.cells[row * self.cols + col].as_ref()
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) {
        if row < self.rows && col < self.cols {
            self.cells[row * self.cols + col] = Some(value);
        }
    }

    /// `t[c][r] = g[r][c]`; empty cells stay empty.
    pub fn transposed(&self) -> DenseGrid<T> {
        let mut out = DenseGrid::new(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                if let Some(v) = self.get(r, c) {
                    out.set(c, r, v.clone());
                }
            }
        }
        out
    }
}

impl DenseGrid<RemotePixel> {
    /// Index a snapshot as `(y - 1, x - 1)`. Missing coordinates (ragged
    /// rows) become empty cells.
    pub fn from_pixels(pixels: &[RemotePixel]) -> Self {
        let rows = pixels.iter().map(|p| p.y as usize).max().unwrap_or(0);
        let cols = pixels.iter().map(|p| p.x as usize).max().unwrap_or(0);
        let mut grid = DenseGrid::new(rows, cols);
        for p in pixels.iter().filter(|p| p.x >= 1 && p.y >= 1) {
            grid.set(p.y as usize - 1, p.x as usize - 1, p.clone());
        }
        grid
    }
}

/// Updates that rewrite the canvas as its transpose.
///
/// For every non-empty, non-white transposed cell `(r, c)` the record living
/// at canvas coordinate `(x = c + 1, y = r + 1)` receives that color. Cells
/// with no destination record are skipped.
pub fn plan(pixels: &[RemotePixel], versions: impl Fn(u32, u32) -> Option<u64>) -> Vec<PixelMutation> {
    let destinations: HashMap<(u32, u32), &PixelId> = pixels.iter().map(|p| ((p.x, p.y), &p.id)).collect();
    let transposed = DenseGrid::from_pixels(pixels).transposed();

    let mut mutations = Vec::new();
    let mut missing = 0usize;
    for r in 0..transposed.rows() {
        for c in 0..transposed.cols() {
            let Some(source) = transposed.get(r, c) else { continue };
            if source.color.is_white() {
                continue;
            }
            let (x, y) = (c as u32 + 1, r as u32 + 1);
            match destinations.get(&(x, y)) {
                Some(id) => mutations.push(PixelMutation {
                    id: (*id).clone(),
                    x,
                    y,
                    color: source.color,
                    version: versions(x, y),
                }),
                None => missing += 1,
            }
        }
    }
    if missing > 0 {
        log::warn!("Transpose: {} cells have no destination record and were skipped", missing);
    }
    mutations
}
