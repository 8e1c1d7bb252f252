// ============================================================================
// PAINT SINKS — fire-and-forget receivers of grid changes
// ============================================================================

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use image::{Rgba, RgbaImage};

use crate::color::Color;
use crate::error::Result;
use crate::grid::CanvasMeta;

/// Receives one call per grid mutation, local or remote.
pub trait PaintSink: Send + 'static {
    fn paint(&mut self, x: u32, y: u32, color: Color);
}

impl PaintSink for Box<dyn PaintSink> {
    fn paint(&mut self, x: u32, y: u32, color: Color) {
        (**self).paint(x, y, color);
    }
}

/// Fan out to two sinks.
impl<A: PaintSink, B: PaintSink> PaintSink for (A, B) {
    fn paint(&mut self, x: u32, y: u32, color: Color) {
        self.0.paint(x, y, color);
        self.1.paint(x, y, color);
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSurface;

impl PaintSink for NullSurface {
    fn paint(&mut self, _x: u32, _y: u32, _color: Color) {}
}

/// Writes every paint to the log at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSurface;

impl PaintSink for LogSurface {
    fn paint(&mut self, x: u32, y: u32, color: Color) {
        log::info!("paint ({}, {}) {}", x, y, color);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remembers every paint call. Clones share the same record.
#[derive(Clone, Debug, Default)]
pub struct RecordingSurface {
    calls: Arc<Mutex<Vec<(u32, u32, Color)>>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(u32, u32, Color)> {
        lock(&self.calls).clone()
    }

    /// Last color painted at `(x, y)`, if any.
    pub fn last_at(&self, x: u32, y: u32) -> Option<Color> {
        lock(&self.calls).iter().rev().find(|c| c.0 == x && c.1 == y).map(|c| c.2)
    }

    pub fn len(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PaintSink for RecordingSurface {
    fn paint(&mut self, x: u32, y: u32, color: Color) {
        lock(&self.calls).push((x, y, color));
    }
}

/// RGBA raster of the canvas, each cell drawn as a `scale × scale` block.
/// Clones share the same buffer.
#[derive(Clone, Debug)]
pub struct RasterSurface {
    buffer: Arc<Mutex<RgbaImage>>,
    meta: CanvasMeta,
    scale: u32,
}

impl RasterSurface {
    pub fn new(meta: CanvasMeta, scale: u32) -> Self {
        let scale = scale.max(1);
        let buffer = RgbaImage::from_pixel(
            meta.width * scale,
            meta.height * scale,
            Color::WHITE.to_rgba(),
        );
        Self { buffer: Arc::new(Mutex::new(buffer)), meta, scale }
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Color drawn at canvas cell `(x, y)`.
    pub fn cell(&self, x: u32, y: u32) -> Option<Rgba<u8>> {
        if !self.meta.contains(x, y) {
            return None;
        }
        let buffer = lock(&self.buffer);
        Some(*buffer.get_pixel((x - 1) * self.scale, (y - 1) * self.scale))
    }

    pub fn to_image(&self) -> RgbaImage {
        lock(&self.buffer).clone()
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        let image = self.to_image();
        image.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }
}

impl PaintSink for RasterSurface {
    fn paint(&mut self, x: u32, y: u32, color: Color) {
        if !self.meta.contains(x, y) {
            return;
        }
        let rgba = color.to_rgba();
        let (x0, y0) = ((x - 1) * self.scale, (y - 1) * self.scale);
        let mut buffer = lock(&self.buffer);
        for dy in 0..self.scale {
            for dx in 0..self.scale {
                buffer.put_pixel(x0 + dx, y0 + dy, rgba);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raster_fills_scaled_block() {
        let mut surface = RasterSurface::new(CanvasMeta::new(3, 2), 4);
        surface.paint(2, 2, Color::BLACK);
        let image = surface.to_image();
        assert_eq!(image.dimensions(), (12, 8));
        assert_eq!(image.get_pixel(4, 4), &Rgba([0, 0, 0, 255]));
        assert_eq!(image.get_pixel(7, 7), &Rgba([0, 0, 0, 255]));
        assert_eq!(image.get_pixel(8, 4), &Rgba([255, 255, 255, 255]));
        assert_eq!(surface.cell(2, 2), Some(Rgba([0, 0, 0, 255])));
    }

    #[test]
    fn raster_ignores_out_of_range() {
        let mut surface = RasterSurface::new(CanvasMeta::new(2, 2), 1);
        surface.paint(0, 1, Color::BLACK);
        surface.paint(3, 1, Color::BLACK);
        assert!(surface.to_image().pixels().all(|p| p == &Rgba([255, 255, 255, 255])));
    }

    #[test]
    fn raster_png_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canvas.png");
        let mut surface = RasterSurface::new(CanvasMeta::new(2, 2), 2);
        surface.paint(1, 2, Color::rgb(0x12, 0x34, 0x56));
        surface.save_png(&path).unwrap();
        let loaded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(loaded.get_pixel(0, 2), &Rgba([0x12, 0x34, 0x56, 255]));
    }

    #[test]
    fn recording_clones_share_calls() {
        let surface = RecordingSurface::new();
        let mut sink = surface.clone();
        sink.paint(1, 1, Color::BLACK);
        sink.paint(1, 1, Color::WHITE);
        assert_eq!(surface.len(), 2);
        assert_eq!(surface.last_at(1, 1), Some(Color::WHITE));
    }
}
