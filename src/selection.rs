// ============================================================================
// SELECTION — drag-derived rectangle in surface space, mapped onto the canvas
// ============================================================================

use crate::error::SyncError;
use crate::grid::CanvasMeta;

/// A pointer position on the rendering surface (scaled pixels).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfacePoint {
    pub x: f32,
    pub y: f32,
}

impl SurfacePoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn floored(self) -> (i32, i32) {
        (self.x.floor() as i32, self.y.floor() as i32)
    }
}

/// Selection in surface coordinates. Width and height stay signed while the
/// user drags up or left of the anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectionRect {
    pub x_from: i32,
    pub y_from: i32,
    pub width: i32,
    pub height: i32,
}

/// Normalized inclusive range in canvas coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanvasRange {
    pub x_min: i64,
    pub x_max: i64,
    pub y_min: i64,
    pub y_max: i64,
}

impl CanvasRange {
    /// Build from two corners in any order.
    pub fn from_corners(x0: i64, y0: i64, x1: i64, y1: i64) -> Self {
        Self {
            x_min: x0.min(x1),
            x_max: x0.max(x1),
            y_min: y0.min(y1),
            y_max: y0.max(y1),
        }
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    /// Number of columns covered, inclusive of both bounds.
    pub fn width(&self) -> u32 {
        (self.x_max - self.x_min + 1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y_max - self.y_min + 1).max(0) as u32
    }

    /// Intersect with the canvas bounds. Fails when nothing remains.
    pub fn clamp_to(&self, meta: &CanvasMeta) -> Result<CanvasRange, SyncError> {
        let clamped = CanvasRange {
            x_min: self.x_min.max(1),
            x_max: self.x_max.min(meta.width as i64),
            y_min: self.y_min.max(1),
            y_max: self.y_max.min(meta.height as i64),
        };
        if clamped.x_min > clamped.x_max || clamped.y_min > clamped.y_max {
            return Err(SyncError::InvalidSelection(format!(
                "selection {}..={} x {}..={} lies outside the {}x{} canvas",
                self.x_min, self.x_max, self.y_min, self.y_max, meta.width, meta.height
            )));
        }
        Ok(clamped)
    }
}

/// Selection mode state machine: toggle, then begin → update* → end.
#[derive(Clone, Debug, Default)]
pub struct SelectionModel {
    enabled: bool,
    dragging: bool,
    anchor: Option<(i32, i32)>,
    current: Option<SelectionRect>,
}

impl SelectionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip selection mode; returns the new state. Disabling mid-drag
    /// abandons the drag but keeps the last rectangle.
    pub fn toggle(&mut self) -> bool {
        self.enabled = !self.enabled;
        if !self.enabled {
            self.dragging = false;
        }
        self.enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_dragging(&self) -> bool {
        self.dragging
    }

    pub fn begin(&mut self, point: SurfacePoint) {
        if !self.enabled {
            return;
        }
        let (x, y) = point.floored();
        self.anchor = Some((x, y));
        self.dragging = true;
        self.current = Some(SelectionRect { x_from: x, y_from: y, width: 0, height: 0 });
    }

    pub fn update(&mut self, point: SurfacePoint) {
        if !self.dragging {
            return;
        }
        self.stretch_to(point);
    }

    pub fn end(&mut self, point: SurfacePoint) {
        if !self.dragging {
            return;
        }
        self.stretch_to(point);
        self.dragging = false;
    }

    fn stretch_to(&mut self, point: SurfacePoint) {
        let Some((ax, ay)) = self.anchor else { return };
        let (x, y) = point.floored();
        self.current = Some(SelectionRect { x_from: ax, y_from: ay, width: x - ax, height: y - ay });
    }

    pub fn current(&self) -> Option<SelectionRect> {
        self.current
    }

    /// Replace the selection outright (programmatic selection).
    pub fn set(&mut self, rect: SelectionRect) {
        self.current = Some(rect);
        self.dragging = false;
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.anchor = None;
        self.dragging = false;
    }

    /// Map the current selection to canvas coordinates.
    ///
    /// Both bounds are floored after dividing by `scale`, then ordered.
    pub fn to_canvas_range(&self, scale: f32) -> Result<CanvasRange, SyncError> {
        let rect = self
            .current
            .ok_or_else(|| SyncError::InvalidSelection("no active selection".into()))?;
        if !(scale > 0.0) {
            return Err(SyncError::InvalidSelection(format!("scale must be positive, got {scale}")));
        }
        let to_canvas = |v: i32| (v as f32 / scale).floor() as i64;
        Ok(CanvasRange::from_corners(
            to_canvas(rect.x_from),
            to_canvas(rect.y_from),
            to_canvas(rect.x_from + rect.width),
            to_canvas(rect.y_from + rect.height),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dragged(from: (f32, f32), to: (f32, f32)) -> SelectionModel {
        let mut model = SelectionModel::new();
        model.toggle();
        model.begin(SurfacePoint::new(from.0, from.1));
        model.update(SurfacePoint::new((from.0 + to.0) / 2.0, (from.1 + to.1) / 2.0));
        model.end(SurfacePoint::new(to.0, to.1));
        model
    }

    #[test]
    fn begin_ignored_while_disabled() {
        let mut model = SelectionModel::new();
        model.begin(SurfacePoint::new(10.0, 10.0));
        model.end(SurfacePoint::new(20.0, 20.0));
        assert!(model.current().is_none());
        assert!(matches!(model.to_canvas_range(6.0), Err(SyncError::InvalidSelection(_))));
    }

    #[test]
    fn drag_produces_floored_rect() {
        let model = dragged((12.7, 18.2), (40.9, 31.5));
        assert_eq!(
            model.current(),
            Some(SelectionRect { x_from: 12, y_from: 18, width: 28, height: 13 })
        );
        assert!(!model.is_dragging());
    }

    #[test]
    fn negative_drag_normalizes() {
        let model = dragged((60.0, 60.0), (12.0, 6.0));
        let rect = model.current().unwrap();
        assert_eq!((rect.width, rect.height), (-48, -54));
        let range = model.to_canvas_range(6.0).unwrap();
        assert_eq!(range, CanvasRange { x_min: 2, x_max: 10, y_min: 1, y_max: 10 });
    }

    #[test]
    fn update_without_drag_is_ignored() {
        let mut model = SelectionModel::new();
        model.toggle();
        model.update(SurfacePoint::new(5.0, 5.0));
        assert!(model.current().is_none());
    }

    #[test]
    fn non_positive_scale_rejected() {
        let model = dragged((0.0, 0.0), (30.0, 30.0));
        assert!(model.to_canvas_range(0.0).is_err());
        assert!(model.to_canvas_range(-1.0).is_err());
    }

    #[test]
    fn clamp_trims_to_canvas_and_rejects_outside() {
        let meta = CanvasMeta::new(5, 5);
        let range = CanvasRange::from_corners(0, 3, 9, 4);
        assert_eq!(
            range.clamp_to(&meta).unwrap(),
            CanvasRange { x_min: 1, x_max: 5, y_min: 3, y_max: 4 }
        );
        assert!(CanvasRange::from_corners(7, 7, 9, 9).clamp_to(&meta).is_err());
    }

    #[test]
    fn range_size_is_inclusive() {
        let range = CanvasRange::from_corners(2, 3, 4, 3);
        assert_eq!((range.width(), range.height()), (3, 1));
    }
}
