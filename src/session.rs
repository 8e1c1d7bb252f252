// ============================================================================
// CANVAS SESSION — single owner of grid, journal and selection for one canvas
// ============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use image::RgbaImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::color::Color;
use crate::dispatch::{BulkDispatcher, DispatchReport};
use crate::error::{Result, SyncError};
use crate::grid::{CanvasMeta, GridStore, Pixel, PixelId, RemoteApply};
use crate::import::{self, ImportPlan};
use crate::ingest::{IngestorHandle, EVENT_CHANNEL_CAPACITY};
use crate::journal::{ChangeJournal, Reversal};
use crate::palette::ColorQuantizer;
use crate::remote::{ChangeEvent, PixelMutation, RemotePixel, RemoteStore, Scope};
use crate::selection::{CanvasRange, SelectionModel, SelectionRect, SurfacePoint};
use crate::settings::Settings;
use crate::snapshot::GridSnapshot;
use crate::surface::PaintSink;
use crate::transpose;

/// A locally applied edit and the remote write it needs, if the record id is
/// known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalEdit {
    pub x: u32,
    pub y: u32,
    pub color: Color,
    pub mutation: Option<PixelMutation>,
}

/// A versioned local write that never landed on the store, either because
/// it failed or because its batch was cancelled first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RejectedWrite {
    pub x: u32,
    pub y: u32,
    pub version: u64,
}

/// Counters for inbound remote events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub remote_applied: u64,
    pub remote_stale: u64,
    /// Foreign canvas or outside the canvas bounds.
    pub remote_ignored: u64,
}

/// Synchronous engine. Every mutation of the local mirror goes through here,
/// and every mutation is forwarded to the paint sink.
pub struct CanvasSession<P: PaintSink> {
    canvas_id: String,
    meta: CanvasMeta,
    grid: GridStore,
    journal: ChangeJournal,
    selection: SelectionModel,
    quantizer: ColorQuantizer,
    surface: P,
    scale: f32,
    rng: StdRng,
    stats: SessionStats,
}

impl<P: PaintSink> CanvasSession<P> {
    pub fn new(
        canvas_id: impl Into<String>,
        meta: CanvasMeta,
        pixels: Vec<RemotePixel>,
        settings: &Settings,
        surface: P,
    ) -> Self {
        let mut grid = GridStore::new(settings.versioned_sync);
        grid.load(pixels.into_iter().filter(|p| meta.contains(p.x, p.y)).map(Pixel::from));
        let mut session = Self {
            canvas_id: canvas_id.into(),
            meta,
            grid,
            journal: ChangeJournal::new(settings.max_undo_steps),
            selection: SelectionModel::new(),
            quantizer: ColorQuantizer::default(),
            surface,
            scale: settings.scale.max(1) as f32,
            rng: StdRng::from_entropy(),
            stats: SessionStats::default(),
        };
        let initial: Vec<(u32, u32, Color)> = session.grid.sorted().iter().map(|p| (p.x, p.y, p.color)).collect();
        for (x, y, color) in initial {
            session.surface.paint(x, y, color);
        }
        log::info!(
            "Session for {} loaded: {}x{}, {} pixels",
            session.canvas_id, meta.width, meta.height, session.grid.len()
        );
        session
    }

    /// Deterministic import shuffles.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn canvas_id(&self) -> &str {
        &self.canvas_id
    }

    pub fn meta(&self) -> CanvasMeta {
        self.meta
    }

    pub fn grid(&self) -> &GridStore {
        &self.grid
    }

    pub fn journal(&self) -> &ChangeJournal {
        &self.journal
    }

    pub fn selection(&self) -> &SelectionModel {
        &self.selection
    }

    pub fn selection_mut(&mut self) -> &mut SelectionModel {
        &mut self.selection
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Write `color` locally and build the versioned remote mutation.
    /// Bumps the stored version so late echoes of older writes are dropped.
    fn apply_local(&mut self, x: u32, y: u32, color: Color) -> LocalEdit {
        self.write_local(x, y, color, true)
    }

    /// Local write; only an `issue`d write builds a mutation and bumps the
    /// version, since the store will never confirm the others.
    fn write_local(&mut self, x: u32, y: u32, color: Color, issue: bool) -> LocalEdit {
        let version = self.grid.next_version(x, y);
        self.grid.upsert(x, y, color);
        self.surface.paint(x, y, color);
        if !issue {
            return LocalEdit { x, y, color, mutation: None };
        }
        let mutation = match self.grid.id_at(x, y) {
            Some(id) => {
                let id = id.clone();
                let version = self.grid.is_versioned().then_some(version);
                if let Some(v) = version {
                    self.grid.set_version(x, y, v);
                }
                Some(PixelMutation { id, x, y, color, version })
            }
            None => {
                log::warn!("No record id known for ({}, {}); edit stays local", x, y);
                None
            }
        };
        LocalEdit { x, y, color, mutation }
    }

    /// Single-pixel paint: journaled, optimistic.
    pub fn paint(&mut self, x: u32, y: u32, color: Color) -> Result<LocalEdit> {
        if !self.meta.contains(x, y) {
            return Err(SyncError::OutOfBounds { x, y, width: self.meta.width, height: self.meta.height });
        }
        let prior = self.grid.get(x, y).map_or(Color::WHITE, |p| p.color);
        self.journal.record_edit(x, y, prior);
        Ok(self.apply_local(x, y, color))
    }

    pub fn undo(&mut self) -> Option<LocalEdit> {
        let Reversal { x, y, color } = self.journal.undo(&self.grid)?;
        Some(self.apply_local(x, y, color))
    }

    pub fn redo(&mut self) -> Option<LocalEdit> {
        let Reversal { x, y, color } = self.journal.redo(&self.grid)?;
        Some(self.apply_local(x, y, color))
    }

    /// Reconcile one inbound event. Returns `true` when the grid changed.
    pub fn apply_remote(&mut self, event: &ChangeEvent) -> bool {
        if event.canvas_id != self.canvas_id || !self.meta.contains(event.x, event.y) {
            self.stats.remote_ignored += 1;
            return false;
        }
        match self.grid.accept_remote(event) {
            RemoteApply::Applied => {
                self.stats.remote_applied += 1;
                self.surface.paint(event.x, event.y, event.color);
                true
            }
            RemoteApply::Stale => {
                self.stats.remote_stale += 1;
                log::debug!(
                    "Dropped stale event for ({}, {}) version {:?}",
                    event.x, event.y, event.version
                );
                false
            }
        }
    }

    /// Roll back the version bump of a write the store never applied, so
    /// the next foreign edit of that cell is recognised as newer.
    pub fn reject_write(&mut self, rejected: RejectedWrite) -> bool {
        let RejectedWrite { x, y, version } = rejected;
        let reverted = self.grid.revert_version(x, y, version);
        if reverted {
            log::debug!("Rolled back version {} of ({}, {})", version, x, y);
        }
        reverted
    }

    /// Select an inclusive canvas range as if it had been dragged. Fails when
    /// the range does not fit the surface coordinate space.
    pub fn select_cells(&mut self, range: CanvasRange) -> Result<()> {
        let scale = self.scale as i64;
        let to_surface = |v: i64| v.checked_mul(scale).and_then(|s| i32::try_from(s).ok());
        let rect = match (
            to_surface(range.x_min),
            to_surface(range.y_min),
            to_surface(range.x_max),
            to_surface(range.y_max),
        ) {
            (Some(x_from), Some(y_from), Some(x_to), Some(y_to)) => {
                match (x_to.checked_sub(x_from), y_to.checked_sub(y_from)) {
                    (Some(width), Some(height)) => Some(SelectionRect { x_from, y_from, width, height }),
                    _ => None,
                }
            }
            _ => None,
        };
        let rect = rect.ok_or_else(|| {
            SyncError::InvalidSelection(format!("{range:?} is too large at scale {}", self.scale))
        })?;
        self.selection.set(rect);
        Ok(())
    }

    /// Current selection mapped onto the canvas and clamped to its bounds.
    pub fn selection_range(&self) -> Result<CanvasRange> {
        self.selection.to_canvas_range(self.scale)?.clamp_to(&self.meta)
    }

    /// Mutations that set every cell of the selection to `color`.
    ///
    /// Clears the journal. The local grid is left untouched: the echoes of
    /// these writes update it, so the versions are not bumped here.
    pub fn plan_fill(&mut self, color: Color) -> Result<Vec<PixelMutation>> {
        let range = self.selection_range()?;
        self.journal.clear();
        let versioned = self.grid.is_versioned();
        let mutations: Vec<PixelMutation> = self
            .grid
            .pixels_in(&range)
            .into_iter()
            .filter(|p| p.color != color)
            .filter_map(|p| {
                Some(PixelMutation {
                    id: p.id.clone()?,
                    x: p.x,
                    y: p.y,
                    color,
                    version: versioned.then(|| self.grid.next_version(p.x, p.y)),
                })
            })
            .collect();
        log::info!("Fill of {:?} with {}: {} pixels to update", range, color, mutations.len());
        Ok(mutations)
    }

    /// Resample and quantize `image` into the current selection.
    pub fn prepare_import(&self, image: &RgbaImage) -> Result<ImportPlan> {
        let range = self.selection_range()?;
        Ok(import::plan(image, &range, &self.quantizer))
    }

    /// Apply an import plan locally and stage the remote writes, shuffled.
    /// White cells are painted but not uploaded.
    pub fn apply_import(&mut self, plan: &ImportPlan) -> Vec<PixelMutation> {
        let mut staged = Vec::new();
        for &(x, y, color) in &plan.cells {
            if !self.meta.contains(x, y) {
                continue;
            }
            if let Some(mutation) = self.write_local(x, y, color, !color.is_white()).mutation {
                staged.push(mutation);
            }
        }
        import::shuffle(&mut staged, &mut self.rng);
        log::info!("Import applied: {} cells, {} staged for upload", plan.cells.len(), staged.len());
        staged
    }

    /// Mutations that rewrite the canvas as its transpose, from a fresh
    /// remote snapshot. Leaves the journal alone.
    pub fn plan_transpose(&self, pixels: &[RemotePixel]) -> Vec<PixelMutation> {
        let versioned = self.grid.is_versioned();
        transpose::plan(pixels, |x, y| versioned.then(|| self.grid.next_version(x, y)))
    }

    pub fn snapshot(&self) -> GridSnapshot {
        let pixels = self.grid.sorted().into_iter().cloned().collect();
        GridSnapshot::new(self.canvas_id.clone(), self.meta, pixels)
    }
}

// ============================================================================
// BULK JOB — a background dispatch the caller can cancel or await
// ============================================================================

#[derive(Debug)]
pub struct BulkJob {
    total: usize,
    cancel: CancellationToken,
    handle: JoinHandle<DispatchReport>,
}

impl BulkJob {
    pub fn spawn<S: RemoteStore>(store: Arc<S>, dispatcher: BulkDispatcher, mutations: Vec<PixelMutation>) -> Self {
        Self::spawn_reporting(store, dispatcher, mutations, None)
    }

    /// Like [`BulkJob::spawn`], and every versioned mutation that failed or
    /// was skipped is sent to `rejected` once the run ends.
    fn spawn_reporting<S: RemoteStore>(
        store: Arc<S>,
        dispatcher: BulkDispatcher,
        mutations: Vec<PixelMutation>,
        rejected: Option<mpsc::UnboundedSender<RejectedWrite>>,
    ) -> Self {
        let total = mutations.len();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let issued: Vec<(PixelId, Option<RejectedWrite>)> = match rejected {
            Some(_) => mutations
                .iter()
                .map(|m| (m.id.clone(), m.version.map(|version| RejectedWrite { x: m.x, y: m.y, version })))
                .collect(),
            None => Vec::new(),
        };
        let handle = tokio::spawn(async move {
            let report = dispatcher.dispatch(&*store, mutations, &token).await;
            if let Some(tx) = rejected {
                for write in unconfirmed(&issued, &report) {
                    let _ = tx.send(write);
                }
            }
            report
        });
        Self { total, cancel, handle }
    }

    /// Number of mutations in the batch.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Stop after the in-flight chunk drains.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<DispatchReport> {
        self.handle.await.map_err(|_| SyncError::SessionClosed)
    }
}

/// Writes of `issued` (in dispatch order) the store never applied: the
/// failed ones plus the tail a cancelled run never issued.
fn unconfirmed(issued: &[(PixelId, Option<RejectedWrite>)], report: &DispatchReport) -> Vec<RejectedWrite> {
    let failed: HashSet<&PixelId> = report.failures.iter().map(|(id, _)| id).collect();
    let attempted = report.succeeded + report.failed;
    issued
        .iter()
        .enumerate()
        .filter(|(i, (id, _))| *i >= attempted || failed.contains(id))
        .filter_map(|(_, (_, write))| *write)
        .collect()
}

// ============================================================================
// SESSION ACTOR — message-passing front of a spawned session task
// ============================================================================

/// Pointer input for the selection model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SelectionInput {
    Toggle,
    Begin(SurfacePoint),
    Update(SurfacePoint),
    End(SurfacePoint),
    Clear,
    Cells(CanvasRange),
}

enum Command {
    Paint {
        x: u32,
        y: u32,
        color: Color,
        responder: oneshot::Sender<Result<LocalEdit>>,
    },
    Undo {
        responder: oneshot::Sender<Option<LocalEdit>>,
    },
    Redo {
        responder: oneshot::Sender<Option<LocalEdit>>,
    },
    Select {
        input: SelectionInput,
        responder: oneshot::Sender<Result<Option<SelectionRect>>>,
    },
    Fill {
        color: Color,
        responder: oneshot::Sender<Result<BulkJob>>,
    },
    Import {
        image: RgbaImage,
        responder: oneshot::Sender<Result<BulkJob>>,
    },
    Transpose {
        pixels: Vec<RemotePixel>,
        responder: oneshot::Sender<BulkJob>,
    },
    Pixel {
        x: u32,
        y: u32,
        responder: oneshot::Sender<Option<Pixel>>,
    },
    History {
        responder: oneshot::Sender<(usize, usize)>,
    },
    Stats {
        responder: oneshot::Sender<SessionStats>,
    },
    Snapshot {
        responder: oneshot::Sender<GridSnapshot>,
    },
    Shutdown,
}

/// Handle to a running session. Dropping it tears the session down.
pub struct SessionHandle<S: RemoteStore> {
    store: Arc<S>,
    canvas_id: String,
    meta: CanvasMeta,
    commands: mpsc::Sender<Command>,
    task: Option<JoinHandle<()>>,
    ingestor: Option<IngestorHandle>,
}

impl<S: RemoteStore> SessionHandle<S> {
    /// Subscribe, load the canvas and spawn the session task.
    pub async fn open<P: PaintSink>(store: Arc<S>, canvas_id: &str, settings: &Settings, surface: P) -> Result<Self> {
        Self::open_with(store, canvas_id, settings, surface, None).await
    }

    /// Like [`SessionHandle::open`] with a fixed import shuffle seed.
    pub async fn open_with<P: PaintSink>(
        store: Arc<S>,
        canvas_id: &str,
        settings: &Settings,
        surface: P,
        seed: Option<u64>,
    ) -> Result<Self> {
        // Subscribe before reading so nothing between snapshot and feed is lost
        let subscription = store.subscribe_changes(Scope::All).await?;
        let meta = store.fetch_canvas_meta(canvas_id).await?;
        let pixels = store.fetch_all_pixels(canvas_id).await?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let ingestor = IngestorHandle::spawn(canvas_id.to_string(), subscription, event_tx);

        let mut session = CanvasSession::new(canvas_id, meta, pixels, settings, surface);
        if let Some(seed) = seed {
            session = session.with_seed(seed);
        }
        let (command_tx, command_rx) = mpsc::channel(64);
        let dispatcher = BulkDispatcher::new(settings.dispatch_config());
        let task = tokio::spawn(run(session, Arc::clone(&store), dispatcher, command_rx, event_rx));

        Ok(Self {
            store,
            canvas_id: canvas_id.to_string(),
            meta,
            commands: command_tx,
            task: Some(task),
            ingestor: Some(ingestor),
        })
    }

    pub fn canvas_id(&self) -> &str {
        &self.canvas_id
    }

    pub fn meta(&self) -> CanvasMeta {
        self.meta
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (responder, receiver) = oneshot::channel();
        self.commands.send(make(responder)).await.map_err(|_| SyncError::SessionClosed)?;
        receiver.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn paint(&self, x: u32, y: u32, color: Color) -> Result<LocalEdit> {
        self.request(|responder| Command::Paint { x, y, color, responder }).await?
    }

    pub async fn undo(&self) -> Result<Option<LocalEdit>> {
        self.request(|responder| Command::Undo { responder }).await
    }

    pub async fn redo(&self) -> Result<Option<LocalEdit>> {
        self.request(|responder| Command::Redo { responder }).await
    }

    /// Feed selection input; returns the resulting rectangle.
    pub async fn select(&self, input: SelectionInput) -> Result<Option<SelectionRect>> {
        self.request(|responder| Command::Select { input, responder }).await?
    }

    /// Fill the selection with `color` in the background.
    pub async fn fill(&self, color: Color) -> Result<BulkJob> {
        self.request(|responder| Command::Fill { color, responder }).await?
    }

    /// Decode `bytes` and import the picture into the selection.
    pub async fn import(&self, bytes: &[u8]) -> Result<BulkJob> {
        let image = import::decode(bytes)?;
        self.request(|responder| Command::Import { image, responder }).await?
    }

    /// Rewrite the whole canvas as its transpose. Can not be undone, so it
    /// needs `confirmed = true`.
    pub async fn transpose(&self, confirmed: bool) -> Result<BulkJob> {
        if !confirmed {
            return Err(SyncError::Unconfirmed("transpose"));
        }
        let pixels = self.store.fetch_all_pixels(&self.canvas_id).await?;
        self.request(|responder| Command::Transpose { pixels, responder }).await
    }

    pub async fn pixel(&self, x: u32, y: u32) -> Result<Option<Pixel>> {
        self.request(|responder| Command::Pixel { x, y, responder }).await
    }

    /// `(undo_count, redo_count)`.
    pub async fn history(&self) -> Result<(usize, usize)> {
        self.request(|responder| Command::History { responder }).await
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.request(|responder| Command::Stats { responder }).await
    }

    pub async fn snapshot(&self) -> Result<GridSnapshot> {
        self.request(|responder| Command::Snapshot { responder }).await
    }

    /// Stop the session task, wait for pending local writes and release the
    /// subscription. Other sessions on the same store keep theirs.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown).await;
        let stopped = match self.task.take() {
            Some(task) => task.await.map_err(|_| SyncError::SessionClosed),
            None => Ok(()),
        };
        if let Some(ingestor) = self.ingestor.take() {
            ingestor.shutdown().await;
        }
        stopped
    }
}

impl<S: RemoteStore> Drop for SessionHandle<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // Dropping the ingestor aborts it and releases the subscription
        self.ingestor.take();
    }
}

/// Session task: one command or one remote event at a time.
async fn run<S: RemoteStore, P: PaintSink>(
    mut session: CanvasSession<P>,
    store: Arc<S>,
    dispatcher: BulkDispatcher,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::Receiver<ChangeEvent>,
) {
    let writes = TaskTracker::new();
    let (rejected_tx, mut rejected) = mpsc::unbounded_channel();
    let mut events_open = true;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => {
                    let context = WriteContext { store: &store, writes: &writes, rejected: &rejected_tx };
                    handle_command(&mut session, &context, dispatcher, command);
                }
            },
            Some(write) = rejected.recv() => {
                session.reject_write(write);
            }
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    session.apply_remote(&event);
                }
                None => {
                    log::warn!("Remote event feed for {} ended", session.canvas_id());
                    events_open = false;
                }
            },
        }
    }
    writes.close();
    writes.wait().await;
    log::info!("Session for {} stopped", session.canvas_id());
}

fn apply_pointer(selection: &mut SelectionModel, input: SelectionInput) {
    match input {
        SelectionInput::Toggle => {
            selection.toggle();
        }
        SelectionInput::Begin(p) => selection.begin(p),
        SelectionInput::Update(p) => selection.update(p),
        SelectionInput::End(p) => selection.end(p),
        SelectionInput::Clear => selection.clear(),
        SelectionInput::Cells(_) => {}
    }
}

/// What a command needs besides the session itself.
struct WriteContext<'a, S: RemoteStore> {
    store: &'a Arc<S>,
    writes: &'a TaskTracker,
    rejected: &'a mpsc::UnboundedSender<RejectedWrite>,
}

impl<S: RemoteStore> WriteContext<'_, S> {
    /// Fire-and-forget remote write for a local edit. A failure keeps the
    /// optimistic paint, is logged and hands the version back to the session.
    fn push_local(&self, edit: &LocalEdit) {
        let Some(mutation) = edit.mutation.clone() else { return };
        let store = Arc::clone(self.store);
        let rejected = self.rejected.clone();
        self.writes.spawn(async move {
            if let Err(e) = store.update_pixel(&mutation).await {
                log::warn!("Remote write for ({}, {}) failed: {}", mutation.x, mutation.y, e);
                if let Some(version) = mutation.version {
                    let _ = rejected.send(RejectedWrite { x: mutation.x, y: mutation.y, version });
                }
            }
        });
    }
}

fn handle_command<S: RemoteStore, P: PaintSink>(
    session: &mut CanvasSession<P>,
    context: &WriteContext<'_, S>,
    dispatcher: BulkDispatcher,
    command: Command,
) {
    let store = context.store;
    match command {
        Command::Paint { x, y, color, responder } => {
            let result = session.paint(x, y, color);
            if let Ok(edit) = &result {
                context.push_local(edit);
            }
            let _ = responder.send(result);
        }
        Command::Undo { responder } => {
            let edit = session.undo();
            if let Some(edit) = &edit {
                context.push_local(edit);
            }
            let _ = responder.send(edit);
        }
        Command::Redo { responder } => {
            let edit = session.redo();
            if let Some(edit) = &edit {
                context.push_local(edit);
            }
            let _ = responder.send(edit);
        }
        Command::Select { input, responder } => {
            let result = match input {
                SelectionInput::Cells(range) => session.select_cells(range),
                pointer => {
                    apply_pointer(session.selection_mut(), pointer);
                    Ok(())
                }
            };
            let _ = responder.send(result.map(|()| session.selection().current()));
        }
        Command::Fill { color, responder } => {
            let result = session
                .plan_fill(color)
                .map(|mutations| BulkJob::spawn(Arc::clone(store), dispatcher, mutations));
            let _ = responder.send(result);
        }
        Command::Import { image, responder } => {
            // Import bumps versions locally, so unconfirmed writes come back
            let result = session.prepare_import(&image).map(|plan| {
                let staged = session.apply_import(&plan);
                BulkJob::spawn_reporting(Arc::clone(store), dispatcher, staged, Some(context.rejected.clone()))
            });
            let _ = responder.send(result);
        }
        Command::Transpose { pixels, responder } => {
            let mutations = session.plan_transpose(&pixels);
            log::info!("Transpose of {}: {} pixels to update", session.canvas_id(), mutations.len());
            let _ = responder.send(BulkJob::spawn(Arc::clone(store), dispatcher, mutations));
        }
        Command::Pixel { x, y, responder } => {
            let _ = responder.send(session.grid().get(x, y).cloned());
        }
        Command::History { responder } => {
            let journal = session.journal();
            let _ = responder.send((journal.undo_count(), journal.redo_count()));
        }
        Command::Stats { responder } => {
            let _ = responder.send(session.stats());
        }
        Command::Snapshot { responder } => {
            let _ = responder.send(session.snapshot());
        }
        Command::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::PixelId;
    use crate::surface::RecordingSurface;

    const RED: Color = Color::rgb(0xFF, 0, 0);
    const GREEN: Color = Color::rgb(0, 0xFF, 0);

    fn blank(w: u32, h: u32) -> Vec<RemotePixel> {
        let mut pixels = Vec::new();
        for y in 1..=h {
            for x in 1..=w {
                pixels.push(RemotePixel { id: PixelId::new(format!("{x}:{y}")), x, y, color: Color::WHITE, version: None });
            }
        }
        pixels
    }

    fn session(versioned: bool) -> (CanvasSession<RecordingSurface>, RecordingSurface) {
        let surface = RecordingSurface::new();
        let settings = Settings { versioned_sync: versioned, ..Settings::default() };
        let session = CanvasSession::new("c1", CanvasMeta::new(5, 5), blank(5, 5), &settings, surface.clone());
        (session, surface)
    }

    fn echo(m: &PixelMutation) -> ChangeEvent {
        ChangeEvent { canvas_id: "c1".into(), pixel_id: m.id.clone(), x: m.x, y: m.y, color: m.color, version: m.version }
    }

    #[test]
    fn paint_undo_redo_emit_mutations_and_paints() {
        let (mut s, surface) = session(true);
        let painted = s.paint(3, 3, RED).unwrap();
        let m = painted.mutation.unwrap();
        assert_eq!((m.id.as_str(), m.version), ("3:3", Some(1)));
        assert_eq!(surface.last_at(3, 3), Some(RED));

        let undone = s.undo().unwrap();
        assert_eq!(undone.color, Color::WHITE);
        assert_eq!(undone.mutation.unwrap().version, Some(2));
        assert_eq!(s.grid().get(3, 3).unwrap().color, Color::WHITE);

        let redone = s.redo().unwrap();
        assert_eq!(redone.color, RED);
        assert_eq!(surface.last_at(3, 3), Some(RED));
        assert!(s.redo().is_none());
    }

    #[test]
    fn paint_outside_canvas_fails() {
        let (mut s, _) = session(true);
        assert!(matches!(s.paint(6, 1, RED), Err(SyncError::OutOfBounds { .. })));
        assert!(matches!(s.paint(0, 1, RED), Err(SyncError::OutOfBounds { .. })));
        assert!(!s.journal().can_undo());
    }

    #[test]
    fn stale_echo_after_undo_is_dropped() {
        let (mut s, _) = session(true);
        let red = s.paint(3, 3, RED).unwrap().mutation.unwrap();
        let white = s.undo().unwrap().mutation.unwrap();
        assert!(!s.apply_remote(&echo(&red)));
        assert!(!s.apply_remote(&echo(&white)));
        assert_eq!(s.grid().get(3, 3).unwrap().color, Color::WHITE);
        assert_eq!(s.stats().remote_stale, 2);
    }

    #[test]
    fn legacy_mode_applies_every_echo() {
        let (mut s, _) = session(false);
        let red = s.paint(3, 3, RED).unwrap().mutation.unwrap();
        assert_eq!(red.version, None);
        s.undo();
        assert!(s.apply_remote(&echo(&red)));
        assert_eq!(s.grid().get(3, 3).unwrap().color, RED);
    }

    #[test]
    fn foreign_canvas_and_out_of_range_events_are_ignored() {
        let (mut s, surface) = session(true);
        let before = surface.len();
        let mut event = ChangeEvent {
            canvas_id: "other".into(),
            pixel_id: PixelId::new("x"),
            x: 1,
            y: 1,
            color: GREEN,
            version: None,
        };
        assert!(!s.apply_remote(&event));
        event.canvas_id = "c1".into();
        event.x = 99;
        assert!(!s.apply_remote(&event));
        assert_eq!(surface.len(), before);
        assert_eq!(s.stats().remote_ignored, 2);
    }

    #[test]
    fn fill_clears_journal_and_skips_matching_cells() {
        let (mut s, _) = session(true);
        s.paint(2, 2, RED).unwrap();
        s.paint(4, 4, RED).unwrap();
        s.select_cells(CanvasRange::from_corners(1, 1, 3, 3)).unwrap();
        let mutations = s.plan_fill(Color::WHITE).unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!((mutations[0].x, mutations[0].y), (2, 2));
        assert!(!s.journal().can_undo());
        // Local grid waits for the echo
        assert_eq!(s.grid().get(2, 2).unwrap().color, RED);
        assert!(s.apply_remote(&echo(&mutations[0])));
        assert_eq!(s.grid().get(2, 2).unwrap().color, Color::WHITE);
    }

    #[test]
    fn fill_without_selection_is_rejected() {
        let (mut s, _) = session(true);
        assert!(matches!(s.plan_fill(Color::WHITE), Err(SyncError::InvalidSelection(_))));
    }

    #[test]
    fn import_stages_non_white_cells_only() {
        let (mut s, surface) = session(true);
        s = s.with_seed(1);
        let mut image = RgbaImage::from_pixel(2, 2, image::Rgba([0, 0, 0, 255]));
        image.put_pixel(0, 0, image::Rgba([255, 255, 255, 255]));
        s.select_cells(CanvasRange::from_corners(2, 2, 3, 3)).unwrap();
        let plan = s.prepare_import(&image).unwrap();
        let staged = s.apply_import(&plan);
        assert_eq!(staged.len(), 3);
        assert!(staged.iter().all(|m| m.color == Color::BLACK));
        assert_eq!(surface.last_at(2, 2), Some(Color::WHITE));
        assert_eq!(s.grid().get(3, 3).unwrap().color, Color::BLACK);
        assert!(!s.journal().can_undo());
    }

    #[test]
    fn white_import_cell_keeps_its_version() {
        let (mut s, surface) = session(true);
        s.paint(1, 1, RED).unwrap();
        let painted = s.grid().get(1, 1).unwrap().version;
        let image = RgbaImage::from_pixel(1, 1, image::Rgba([255, 255, 255, 255]));
        s.select_cells(CanvasRange::from_corners(1, 1, 1, 1)).unwrap();
        let plan = s.prepare_import(&image).unwrap();
        assert!(s.apply_import(&plan).is_empty());
        assert_eq!(surface.last_at(1, 1), Some(Color::WHITE));
        assert_eq!(s.grid().get(1, 1).unwrap().version, painted);

        let foreign = ChangeEvent {
            canvas_id: "c1".into(),
            pixel_id: PixelId::new("1:1"),
            x: 1,
            y: 1,
            color: GREEN,
            version: Some(painted + 1),
        };
        assert!(s.apply_remote(&foreign));
        assert_eq!(s.grid().get(1, 1).unwrap().color, GREEN);
    }

    #[test]
    fn rejected_write_lets_the_next_foreign_edit_through() {
        let (mut s, _) = session(true);
        let m = s.paint(2, 2, RED).unwrap().mutation.unwrap();
        assert_eq!(m.version, Some(1));
        assert!(s.reject_write(RejectedWrite { x: 2, y: 2, version: 1 }));
        assert_eq!(s.grid().get(2, 2).unwrap().version, 0);
        // Already rolled back
        assert!(!s.reject_write(RejectedWrite { x: 2, y: 2, version: 1 }));
        // The optimistic color stays
        assert_eq!(s.grid().get(2, 2).unwrap().color, RED);

        let foreign = ChangeEvent {
            canvas_id: "c1".into(),
            pixel_id: m.id.clone(),
            x: 2,
            y: 2,
            color: GREEN,
            version: Some(1),
        };
        assert!(s.apply_remote(&foreign));
        assert_eq!(s.grid().get(2, 2).unwrap().color, GREEN);
    }

    #[test]
    fn rejected_write_ignores_superseded_versions() {
        let (mut s, _) = session(true);
        s.paint(2, 2, RED).unwrap();
        s.paint(2, 2, GREEN).unwrap();
        assert!(!s.reject_write(RejectedWrite { x: 2, y: 2, version: 1 }));
        assert_eq!(s.grid().get(2, 2).unwrap().version, 2);
    }

    #[test]
    fn unconfirmed_collects_failures_and_the_skipped_tail() {
        let write = |x: u32| Some(RejectedWrite { x, y: 1, version: 3 });
        let issued = vec![
            (PixelId::new("a"), write(1)),
            (PixelId::new("b"), write(2)),
            (PixelId::new("c"), None),
            (PixelId::new("d"), write(4)),
            (PixelId::new("e"), write(5)),
        ];
        let report = DispatchReport {
            chunks: 1,
            succeeded: 2,
            failed: 1,
            skipped: 2,
            failures: vec![(PixelId::new("b"), SyncError::NetworkFailure("503".into()))],
            cancelled: true,
        };
        assert_eq!(unconfirmed(&issued, &report), vec![write(2).unwrap(), write(4).unwrap(), write(5).unwrap()]);
    }

    #[test]
    fn oversized_cell_selection_is_rejected() {
        let (mut s, _) = session(true);
        s.select_cells(CanvasRange::from_corners(1, 1, 2, 2)).unwrap();
        let before = s.selection().current();
        // 500_000_000 cells at scale 6 is past i32::MAX surface pixels
        let result = s.select_cells(CanvasRange::from_corners(1, 1, 500_000_000, 1));
        assert!(matches!(result, Err(SyncError::InvalidSelection(_))));
        assert_eq!(s.selection().current(), before);
        assert!(matches!(
            s.select_cells(CanvasRange::from_corners(i64::MIN, 1, 1, 1)),
            Err(SyncError::InvalidSelection(_))
        ));
    }

    #[test]
    fn transpose_plan_uses_next_versions() {
        let (s, _) = session(true);
        let mut pixels = blank(5, 5);
        pixels[1].color = GREEN; // (2, 1)
        let mutations = s.plan_transpose(&pixels);
        assert_eq!(mutations.len(), 1);
        assert_eq!((mutations[0].x, mutations[0].y, mutations[0].version), (1, 2, Some(1)));
    }

    #[test]
    fn snapshot_is_row_major() {
        let (s, _) = session(true);
        let snapshot = s.snapshot();
        assert_eq!(snapshot.pixels.len(), 25);
        assert_eq!((snapshot.pixels[0].x, snapshot.pixels[0].y), (1, 1));
        assert_eq!((snapshot.pixels[5].x, snapshot.pixels[5].y), (1, 2));
    }
}
