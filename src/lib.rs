//! PixelSync: synchronization and bulk-mutation engine for a shared pixel
//! canvas backed by a remote authoritative store.
//!
//! [`session::SessionHandle`] is the usual entry point: it loads a canvas,
//! keeps the local [`grid::GridStore`] consistent with the remote feed and
//! runs fills, imports and transposition as paced background batches.

pub mod cli;
pub mod color;
pub mod dispatch;
pub mod error;
pub mod grid;
pub mod import;
pub mod ingest;
pub mod journal;
pub mod logger;
pub mod palette;
pub mod remote;
pub mod selection;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod surface;
pub mod transpose;

pub use color::Color;
pub use error::{Result, SyncError};
pub use grid::{CanvasMeta, GridStore, Pixel, PixelId};
pub use remote::{ChangeEvent, PixelMutation, RemoteStore};
pub use session::{BulkJob, CanvasSession, SessionHandle};
pub use settings::Settings;
