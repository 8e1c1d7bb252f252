// ============================================================================
// IMAGE IMPORT — decode, fit into the selection, quantize to the palette
// ============================================================================

use image::imageops::{self, FilterType};
use image::RgbaImage;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;

use crate::color::Color;
use crate::error::{Result, SyncError};
use crate::palette::ColorQuantizer;
use crate::selection::CanvasRange;

/// Decode any supported raster (PNG, JPEG, GIF, WEBP, BMP) into RGBA.
pub fn decode(bytes: &[u8]) -> Result<RgbaImage> {
    let img = image::load_from_memory(bytes)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(SyncError::DecodeFailure("image has no pixels".into()));
    }
    Ok(img.to_rgba8())
}

/// Where a resized image lands inside the target box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub width: u32,
    pub height: u32,
    pub x_offset: u32,
    pub y_offset: u32,
}

/// Fit an image into a target box keeping its aspect ratio, centered.
///
/// Landscape images fit the width first and fall back to the height if that
/// overflows; portrait and square images do the opposite.
pub fn fit(img_w: u32, img_h: u32, target_w: u32, target_h: u32) -> Placement {
    let target_w = target_w.max(1);
    let target_h = target_h.max(1);
    let aspect = img_w.max(1) as f64 / img_h.max(1) as f64;
    let (tw, th) = (target_w as f64, target_h as f64);

    let (mut w, mut h) = (tw, th);
    if aspect > 1.0 {
        h = tw / aspect;
        if h > th {
            h = th;
            w = th * aspect;
        }
    } else {
        w = th * aspect;
        if w > tw {
            w = tw;
            h = tw / aspect;
        }
    }

    let width = (w.round() as u32).clamp(1, target_w);
    let height = (h.round() as u32).clamp(1, target_h);
    Placement {
        width,
        height,
        x_offset: (target_w - width) / 2,
        y_offset: (target_h - height) / 2,
    }
}

/// Result of planning an import: the quantized cells to write, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct ImportPlan {
    pub placement: Placement,
    pub cells: Vec<(u32, u32, Color)>,
}

/// Resample `image` into `range` and quantize every opaque cell.
pub fn plan(image: &RgbaImage, range: &CanvasRange, quantizer: &ColorQuantizer) -> ImportPlan {
    let placement = fit(image.width(), image.height(), range.width(), range.height());
    let resized = imageops::resize(image, placement.width, placement.height, FilterType::Triangle);

    let origin_x = range.x_min + placement.x_offset as i64;
    let origin_y = range.y_min + placement.y_offset as i64;

    let cells: Vec<(u32, u32, Color)> = (0..placement.height)
        .into_par_iter()
        .flat_map_iter(|ty| {
            let resized = &resized;
            (0..placement.width).filter_map(move |tx| {
                let px = resized.get_pixel(tx, ty);
                if px[3] == 0 {
                    return None;
                }
                let x = origin_x + tx as i64;
                let y = origin_y + ty as i64;
                if x < 1 || y < 1 {
                    return None;
                }
                Some((x as u32, y as u32, quantizer.nearest(px[0], px[1], px[2])))
            })
        })
        .collect();

    log::debug!(
        "Import planned: {}x{} at +{}+{}, {} opaque cells",
        placement.width, placement.height, placement.x_offset, placement.y_offset, cells.len()
    );
    ImportPlan { placement, cells }
}

/// Uniform in-place Fisher-Yates shuffle.
pub fn shuffle<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    items.shuffle(rng);
}
