use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::color::Color;
use crate::remote::ChangeEvent;
use crate::selection::CanvasRange;

// ============================================================================
// PIXEL RECORDS
// ============================================================================

/// Opaque identifier the remote store assigns to each pixel record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelId(pub String);

impl PixelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PixelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed canvas dimensions; valid coordinates are `[1, width] × [1, height]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasMeta {
    pub width: u32,
    pub height: u32,
}

impl CanvasMeta {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= 1 && y >= 1 && x <= self.width && y <= self.height
    }

    /// The whole canvas as an inclusive range.
    pub fn full_range(&self) -> CanvasRange {
        CanvasRange { x_min: 1, x_max: self.width as i64, y_min: 1, y_max: self.height as i64 }
    }
}

/// One cell of the local mirror.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pixel {
    /// `None` until the remote store has told us the record id.
    pub id: Option<PixelId>,
    pub x: u32,
    pub y: u32,
    pub color: Color,
    /// Last accepted per-coordinate version (0 = unknown).
    pub version: u64,
}

impl Pixel {
    pub fn new(id: Option<PixelId>, x: u32, y: u32, color: Color) -> Self {
        Self { id, x, y, color, version: 0 }
    }
}

/// Outcome of reconciling one inbound remote event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteApply {
    /// Event applied; the cell needs repainting.
    Applied,
    /// Event carried an older version, or ours with our own color; dropped.
    Stale,
}

// ============================================================================
// GRID STORE — local mirror of the remote canvas
// ============================================================================

/// In-memory map from coordinate to pixel.
///
/// Entries are created on first observation and are never removed; every
/// write overwrites in place so a coordinate holds at most one entry.
#[derive(Clone, Debug, Default)]
pub struct GridStore {
    pixels: HashMap<(u32, u32), Pixel>,
    /// When false, remote events always win by arrival order.
    versioned: bool,
}

impl GridStore {
    pub fn new(versioned: bool) -> Self {
        Self { pixels: HashMap::new(), versioned }
    }

    /// Replace the full map, typically with the initial remote snapshot.
    pub fn load(&mut self, pixels: impl IntoIterator<Item = Pixel>) {
        self.pixels.clear();
        for pixel in pixels {
            self.pixels.insert((pixel.x, pixel.y), pixel);
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<&Pixel> {
        self.pixels.get(&(x, y))
    }

    /// Insert or overwrite the color at `(x, y)`. Returns `true` when the
    /// stored color changed.
    pub fn upsert(&mut self, x: u32, y: u32, color: Color) -> bool {
        match self.pixels.get_mut(&(x, y)) {
            Some(pixel) => {
                let changed = pixel.color != color;
                pixel.color = color;
                changed
            }
            None => {
                self.pixels.insert((x, y), Pixel::new(None, x, y, color));
                true
            }
        }
    }

    /// Upsert from an unvalidated hex string.
    pub fn upsert_hex(&mut self, x: u32, y: u32, color: &str) -> Result<bool, crate::error::SyncError> {
        let color = Color::from_hex(color)?;
        Ok(self.upsert(x, y, color))
    }

    pub fn id_at(&self, x: u32, y: u32) -> Option<&PixelId> {
        self.get(x, y).and_then(|p| p.id.as_ref())
    }

    pub fn find_by_id(&self, id: &PixelId) -> Option<&Pixel> {
        self.pixels.values().find(|p| p.id.as_ref() == Some(id))
    }

    /// Version a new local mutation of `(x, y)` should carry.
    pub fn next_version(&self, x: u32, y: u32) -> u64 {
        self.get(x, y).map_or(0, |p| p.version) + 1
    }

    /// Record that a locally issued mutation is now the newest intent.
    pub fn set_version(&mut self, x: u32, y: u32, version: u64) {
        if let Some(pixel) = self.pixels.get_mut(&(x, y)) {
            pixel.version = pixel.version.max(version);
        }
    }

    /// Undo the version bump of a local mutation that never reached the
    /// store. Only applies while `issued` is still the stored version, so a
    /// newer local edit or remote event is left alone. Returns `true` when
    /// the version was rolled back.
    pub fn revert_version(&mut self, x: u32, y: u32, issued: u64) -> bool {
        match self.pixels.get_mut(&(x, y)) {
            Some(pixel) if issued > 0 && pixel.version == issued => {
                pixel.version = issued - 1;
                true
            }
            _ => false,
        }
    }

    /// Reconcile an inbound remote event.
    ///
    /// Versioned events older than the stored version are dropped. An event at
    /// the stored version is an echo only when it carries the stored color;
    /// with any other color the store holds something our write never
    /// replaced, and the store wins. Unversioned events (or any event with
    /// versioning off) overwrite.
    pub fn accept_remote(&mut self, event: &ChangeEvent) -> RemoteApply {
        let versioned = self.versioned;
        let pixel = self
            .pixels
            .entry((event.x, event.y))
            .or_insert_with(|| Pixel::new(None, event.x, event.y, event.color));

        if let (true, Some(incoming)) = (versioned, event.version) {
            let stale = pixel.version > incoming || (pixel.version == incoming && pixel.color == event.color);
            if stale && pixel.version > 0 {
                return RemoteApply::Stale;
            }
            pixel.version = pixel.version.max(incoming);
        }
        pixel.color = event.color;
        if pixel.id.is_none() {
            pixel.id = Some(event.pixel_id.clone());
        }
        RemoteApply::Applied
    }

    /// Pixels inside an inclusive range, ordered row-major.
    pub fn pixels_in(&self, range: &CanvasRange) -> Vec<&Pixel> {
        let mut hits: Vec<&Pixel> = self
            .pixels
            .values()
            .filter(|p| range.contains(p.x as i64, p.y as i64))
            .collect();
        hits.sort_by_key(|p| (p.y, p.x));
        hits
    }

    /// All pixels ordered row-major.
    pub fn sorted(&self) -> Vec<&Pixel> {
        let mut all: Vec<&Pixel> = self.pixels.values().collect();
        all.sort_by_key(|p| (p.y, p.x));
        all
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn is_versioned(&self) -> bool {
        self.versioned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(x: u32, y: u32, color: &str, version: Option<u64>) -> ChangeEvent {
        ChangeEvent {
            canvas_id: "c1".into(),
            pixel_id: PixelId::new(format!("p{x}_{y}")),
            x,
            y,
            color: color.parse().unwrap(),
            version,
        }
    }

    #[test]
    fn upsert_then_get_returns_uppercase() {
        let mut grid = GridStore::new(true);
        assert!(grid.upsert_hex(3, 4, "#ff00ff").unwrap());
        assert_eq!(grid.get(3, 4).unwrap().color.to_hex(), "#FF00FF");
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut grid = GridStore::new(true);
        grid.upsert(1, 1, Color::BLACK);
        let before = grid.get(1, 1).cloned();
        assert!(!grid.upsert(1, 1, Color::BLACK));
        assert_eq!(grid.get(1, 1).cloned(), before);
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn load_replaces_everything() {
        let mut grid = GridStore::new(true);
        grid.upsert(9, 9, Color::BLACK);
        grid.load(vec![Pixel::new(Some(PixelId::new("a")), 1, 2, Color::WHITE)]);
        assert!(grid.get(9, 9).is_none());
        assert_eq!(grid.id_at(1, 2), Some(&PixelId::new("a")));
        assert_eq!(grid.find_by_id(&PixelId::new("a")).map(|p| (p.x, p.y)), Some((1, 2)));
    }

    #[test]
    fn stale_versioned_event_is_dropped() {
        let mut grid = GridStore::new(true);
        grid.load(vec![Pixel::new(Some(PixelId::new("p1_1")), 1, 1, Color::WHITE)]);

        // Two local edits: versions 1 then 2.
        grid.upsert(1, 1, Color::BLACK);
        grid.set_version(1, 1, grid.next_version(1, 1));
        grid.upsert(1, 1, Color::rgb(0xFF, 0, 0));
        grid.set_version(1, 1, grid.next_version(1, 1));

        // Late echo of the first edit.
        assert_eq!(grid.accept_remote(&event(1, 1, "#000000", Some(1))), RemoteApply::Stale);
        assert_eq!(grid.get(1, 1).unwrap().color, Color::rgb(0xFF, 0, 0));

        // A genuinely newer foreign edit wins.
        assert_eq!(grid.accept_remote(&event(1, 1, "#00ff00", Some(3))), RemoteApply::Applied);
        assert_eq!(grid.get(1, 1).unwrap().color, Color::rgb(0, 0xFF, 0));
    }

    #[test]
    fn equal_version_with_other_color_is_applied() {
        let mut grid = GridStore::new(true);
        grid.load(vec![Pixel::new(Some(PixelId::new("p1_1")), 1, 1, Color::WHITE)]);
        grid.upsert(1, 1, Color::BLACK);
        grid.set_version(1, 1, 1);

        // Our own echo at the same version is dropped
        assert_eq!(grid.accept_remote(&event(1, 1, "#000000", Some(1))), RemoteApply::Stale);
        // A different color at that version means our write never landed
        assert_eq!(grid.accept_remote(&event(1, 1, "#00ff00", Some(1))), RemoteApply::Applied);
        assert_eq!(grid.get(1, 1).unwrap().color, Color::rgb(0, 0xFF, 0));
        assert_eq!(grid.get(1, 1).unwrap().version, 1);
    }

    #[test]
    fn revert_version_only_touches_the_issued_version() {
        let mut grid = GridStore::new(true);
        grid.load(vec![Pixel::new(Some(PixelId::new("p1_1")), 1, 1, Color::WHITE)]);
        grid.set_version(1, 1, 1);
        grid.set_version(1, 1, 2);
        assert!(!grid.revert_version(1, 1, 1));
        assert_eq!(grid.get(1, 1).unwrap().version, 2);
        assert!(grid.revert_version(1, 1, 2));
        assert_eq!(grid.get(1, 1).unwrap().version, 1);
        assert!(!grid.revert_version(9, 9, 1));

        // After the rollback a foreign edit at version 2 is newer again
        assert_eq!(grid.accept_remote(&event(1, 1, "#00ff00", Some(2))), RemoteApply::Applied);
    }

    #[test]
    fn unversioned_grid_takes_last_arrival() {
        let mut grid = GridStore::new(false);
        grid.upsert(1, 1, Color::BLACK);
        grid.set_version(1, 1, 5);
        assert_eq!(grid.accept_remote(&event(1, 1, "#ffffff", Some(1))), RemoteApply::Applied);
        assert_eq!(grid.get(1, 1).unwrap().color, Color::WHITE);
    }

    #[test]
    fn remote_event_creates_missing_entry_with_id() {
        let mut grid = GridStore::new(true);
        grid.accept_remote(&event(2, 3, "#123456", None));
        let pixel = grid.get(2, 3).unwrap();
        assert_eq!(pixel.id, Some(PixelId::new("p2_3")));
        assert_eq!(pixel.color.to_hex(), "#123456");
    }

    #[test]
    fn pixels_in_filters_and_orders() {
        let mut grid = GridStore::new(true);
        for y in 1..=3 {
            for x in 1..=3 {
                grid.upsert(x, y, Color::WHITE);
            }
        }
        let range = CanvasRange { x_min: 2, x_max: 3, y_min: 1, y_max: 2 };
        let coords: Vec<(u32, u32)> = grid.pixels_in(&range).iter().map(|p| (p.x, p.y)).collect();
        assert_eq!(coords, vec![(2, 1), (3, 1), (2, 2), (3, 2)]);
    }
}
