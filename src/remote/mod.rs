//! Remote authoritative store: the trait the engine consumes plus its
//! adapters.

pub mod http;
pub mod memory;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::color::Color;
use crate::error::Result;
use crate::grid::{CanvasMeta, Pixel, PixelId};

pub use http::HttpStore;
pub use memory::MemoryStore;

// ============================================================================
// WIRE-LEVEL TYPES
// ============================================================================

/// A pixel record as returned by a full snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePixel {
    pub id: PixelId,
    pub x: u32,
    pub y: u32,
    pub color: Color,
    pub version: Option<u64>,
}

impl From<RemotePixel> for Pixel {
    fn from(remote: RemotePixel) -> Self {
        Pixel {
            id: Some(remote.id),
            x: remote.x,
            y: remote.y,
            color: remote.color,
            version: remote.version.unwrap_or(0),
        }
    }
}

/// Update destined for the remote store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelMutation {
    pub id: PixelId,
    pub x: u32,
    pub y: u32,
    pub color: Color,
    /// Per-coordinate version; `None` when versioned sync is off.
    pub version: Option<u64>,
}

/// Change notification pushed by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub canvas_id: String,
    pub pixel_id: PixelId,
    pub x: u32,
    pub y: u32,
    pub color: Color,
    pub version: Option<u64>,
}

/// What a subscription listens to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every pixel record (`"*"`).
    All,
    Record(PixelId),
}

impl Scope {
    pub fn matches(&self, id: &PixelId) -> bool {
        match self {
            Scope::All => true,
            Scope::Record(own) => own == id,
        }
    }

    /// Topic string used on the wire.
    pub fn topic(&self, collection: &str) -> String {
        match self {
            Scope::All => format!("{collection}/*"),
            Scope::Record(id) => format!("{collection}/{id}"),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("*"),
            Scope::Record(id) => write!(f, "{id}"),
        }
    }
}

// ============================================================================
// SUBSCRIPTION — event stream plus release-on-drop guard
// ============================================================================

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Stream of change events for one scope.
///
/// Dropping the subscription releases it on the store side, so an owner that
/// exits abnormally still tears the subscription down.
pub struct Subscription {
    scope: Scope,
    events: BoxStream<'static, ChangeEvent>,
    release: Option<ReleaseFn>,
}

impl Subscription {
    pub fn new(
        scope: Scope,
        events: impl Stream<Item = ChangeEvent> + Send + 'static,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self { scope, events: events.boxed(), release: Some(Box::new(release)) }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("scope", &self.scope).finish_non_exhaustive()
    }
}

// ============================================================================
// REMOTE STORE TRAIT
// ============================================================================

/// Authoritative pixel store with change notifications.
pub trait RemoteStore: Send + Sync + 'static {
    fn fetch_canvas_meta(&self, canvas_id: &str) -> impl Future<Output = Result<CanvasMeta>> + Send;

    /// Full snapshot of a canvas, record ids included.
    fn fetch_all_pixels(&self, canvas_id: &str) -> impl Future<Output = Result<Vec<RemotePixel>>> + Send;

    fn update_pixel(&self, mutation: &PixelMutation) -> impl Future<Output = Result<()>> + Send;

    /// Events are delivered until the subscription is dropped or
    /// [`RemoteStore::unsubscribe`] is called for its scope.
    fn subscribe_changes(&self, scope: Scope) -> impl Future<Output = Result<Subscription>> + Send;

    /// Ends every subscription of `scope` on this store, including those
    /// other sessions hold. Dropping a [`Subscription`] releases just that one.
    fn unsubscribe(&self, scope: &Scope) -> impl Future<Output = Result<()>> + Send;
}
