// ============================================================================
// GRID SNAPSHOTS (.pxs) — bincode dump of the local mirror
// ============================================================================

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::grid::{CanvasMeta, Pixel};

/// Magic header of the snapshot format.
const PXS_MAGIC_V1: &str = "PXS1";

/// Maximum supported canvas dimension per axis.
/// Prevents memory exhaustion from crafted snapshot files.
const MAX_CANVAS_DIM: u32 = 32_768;

/// Serializable grid state for one canvas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    magic: String,
    pub canvas_id: String,
    pub meta: CanvasMeta,
    /// Row-major.
    pub pixels: Vec<Pixel>,
}

impl GridSnapshot {
    pub fn new(canvas_id: impl Into<String>, meta: CanvasMeta, pixels: Vec<Pixel>) -> Self {
        Self { magic: PXS_MAGIC_V1.to_string(), canvas_id: canvas_id.into(), meta, pixels }
    }
}

/// Safe to call on a background thread.
pub fn save_snapshot(snapshot: &GridSnapshot, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, snapshot)?;
    log::info!("Saved snapshot of {} ({} pixels) to {}", snapshot.canvas_id, snapshot.pixels.len(), path.display());
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<GridSnapshot> {
    let raw = std::fs::read(path)?;
    if raw.len() < 12 {
        return Err(SyncError::Snapshot("file too small".into()));
    }

    // bincode encodes a String as an 8-byte length prefix + UTF-8 data,
    // so bytes 8..12 hold the magic.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != PXS_MAGIC_V1 {
        return Err(SyncError::Snapshot(format!("unknown magic '{}'", magic)));
    }

    let snapshot: GridSnapshot = bincode::deserialize(&raw)?;
    let CanvasMeta { width, height } = snapshot.meta;
    if width == 0 || height == 0 {
        return Err(SyncError::Snapshot("canvas dimensions cannot be zero".into()));
    }
    if width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
        return Err(SyncError::Snapshot(format!(
            "canvas size {}x{} exceeds maximum allowed {}x{}",
            width, height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    if let Some(p) = snapshot.pixels.iter().find(|p| !snapshot.meta.contains(p.x, p.y)) {
        return Err(SyncError::Snapshot(format!(
            "pixel ({}, {}) lies outside the {}x{} canvas",
            p.x, p.y, width, height
        )));
    }
    Ok(snapshot)
}
