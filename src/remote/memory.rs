//! In-process authoritative store. Used by the `--memory` CLI mode and by tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::channel::mpsc;

use super::{ChangeEvent, PixelMutation, RemotePixel, RemoteStore, Scope, Subscription};
use crate::color::Color;
use crate::error::{Result, SyncError};
use crate::grid::{CanvasMeta, PixelId};

#[derive(Clone, Debug)]
struct Record {
    canvas_id: String,
    x: u32,
    y: u32,
    color: Color,
    version: u64,
}

struct Subscriber {
    id: u64,
    scope: Scope,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct Inner {
    canvases: HashMap<String, CanvasMeta>,
    records: HashMap<PixelId, Record>,
    by_coord: HashMap<(String, u32, u32), PixelId>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    fail_ids: HashSet<PixelId>,
    applied: Vec<PixelMutation>,
}

impl Inner {
    fn publish(&mut self, id: &PixelId) {
        let Some(record) = self.records.get(id) else { return };
        let event = ChangeEvent {
            canvas_id: record.canvas_id.clone(),
            pixel_id: id.clone(),
            x: record.x,
            y: record.y,
            color: record.color,
            version: Some(record.version),
        };
        // Receivers that went away are pruned on the next publish
        self.subscribers
            .retain(|s| !s.scope.matches(id) || s.tx.unbounded_send(event.clone()).is_ok());
    }

    fn insert(&mut self, canvas_id: &str, x: u32, y: u32, color: Color) -> PixelId {
        let key = (canvas_id.to_string(), x, y);
        if let Some(id) = self.by_coord.get(&key) {
            let id = id.clone();
            if let Some(record) = self.records.get_mut(&id) {
                record.color = color;
            }
            return id;
        }
        let id = PixelId::new(uuid::Uuid::new_v4().simple().to_string());
        self.records.insert(
            id.clone(),
            Record { canvas_id: canvas_id.to_string(), x, y, color, version: 0 },
        );
        self.by_coord.insert(key, id.clone());
        id
    }
}

/// Shared in-memory store. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with one blank (all-white) canvas.
    pub fn with_blank_canvas(canvas_id: &str, width: u32, height: u32) -> Self {
        let store = Self::new();
        store.add_blank_canvas(canvas_id, width, height);
        store
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the maps consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Register a canvas without any pixel records.
    pub fn add_canvas(&self, canvas_id: &str, width: u32, height: u32) {
        self.lock().canvases.insert(canvas_id.to_string(), CanvasMeta::new(width, height));
    }

    pub fn add_blank_canvas(&self, canvas_id: &str, width: u32, height: u32) {
        let mut inner = self.lock();
        inner.canvases.insert(canvas_id.to_string(), CanvasMeta::new(width, height));
        for y in 1..=height {
            for x in 1..=width {
                inner.insert(canvas_id, x, y, Color::WHITE);
            }
        }
    }

    /// Create or recolor one record without notifying subscribers.
    pub fn insert_pixel(&self, canvas_id: &str, x: u32, y: u32, color: Color) -> PixelId {
        self.lock().insert(canvas_id, x, y, color)
    }

    /// Apply an edit as another client would, notifying subscribers.
    pub fn foreign_edit(&self, canvas_id: &str, x: u32, y: u32, color: Color) -> Option<PixelId> {
        let mut inner = self.lock();
        let id = inner.by_coord.get(&(canvas_id.to_string(), x, y))?.clone();
        if let Some(record) = inner.records.get_mut(&id) {
            record.color = color;
            record.version += 1;
        }
        inner.publish(&id);
        Some(id)
    }

    /// Make every future update of `id` fail.
    pub fn fail_updates_for(&self, id: PixelId) {
        self.lock().fail_ids.insert(id);
    }

    pub fn pixel_id_at(&self, canvas_id: &str, x: u32, y: u32) -> Option<PixelId> {
        self.lock().by_coord.get(&(canvas_id.to_string(), x, y)).cloned()
    }

    pub fn color_at(&self, canvas_id: &str, x: u32, y: u32) -> Option<Color> {
        let inner = self.lock();
        let id = inner.by_coord.get(&(canvas_id.to_string(), x, y))?;
        inner.records.get(id).map(|r| r.color)
    }

    /// Successful updates in the order they were applied.
    pub fn applied_updates(&self) -> Vec<PixelMutation> {
        self.lock().applied.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.iter().filter(|s| !s.tx.is_closed()).count()
    }
}

impl RemoteStore for MemoryStore {
    async fn fetch_canvas_meta(&self, canvas_id: &str) -> Result<CanvasMeta> {
        self.simulate_latency().await;
        self.lock()
            .canvases
            .get(canvas_id)
            .copied()
            .ok_or_else(|| SyncError::not_found(format!("canvas {canvas_id}")))
    }

    async fn fetch_all_pixels(&self, canvas_id: &str) -> Result<Vec<RemotePixel>> {
        self.simulate_latency().await;
        let inner = self.lock();
        if !inner.canvases.contains_key(canvas_id) {
            return Err(SyncError::not_found(format!("canvas {canvas_id}")));
        }
        let mut pixels: Vec<RemotePixel> = inner
            .records
            .iter()
            .filter(|(_, r)| r.canvas_id == canvas_id)
            .map(|(id, r)| RemotePixel {
                id: id.clone(),
                x: r.x,
                y: r.y,
                color: r.color,
                version: Some(r.version),
            })
            .collect();
        pixels.sort_by_key(|p| (p.y, p.x));
        Ok(pixels)
    }

    async fn update_pixel(&self, mutation: &PixelMutation) -> Result<()> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        if inner.fail_ids.contains(&mutation.id) {
            return Err(SyncError::network(format!("injected failure for {}", mutation.id)));
        }
        let record = inner
            .records
            .get_mut(&mutation.id)
            .ok_or_else(|| SyncError::not_found(format!("pixel {}", mutation.id)))?;
        record.color = mutation.color;
        // The store stays authoritative: a stale client version never rewinds it
        record.version = (record.version + 1).max(mutation.version.unwrap_or(0));
        inner.applied.push(mutation.clone());
        inner.publish(&mutation.id);
        Ok(())
    }

    async fn subscribe_changes(&self, scope: Scope) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded();
        let id = {
            let mut inner = self.lock();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.push(Subscriber { id, scope: scope.clone(), tx });
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(scope, rx, move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                inner.subscribers.retain(|s| s.id != id);
            }
        }))
    }

    async fn unsubscribe(&self, scope: &Scope) -> Result<()> {
        self.lock().subscribers.retain(|s| &s.scope != scope);
        Ok(())
    }
}
