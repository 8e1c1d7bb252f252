// ============================================================================
// PixelSync CLI — drive a shared canvas session from the command line
// ============================================================================
//
// Usage examples:
//   pixelsync --canvas abc123 watch --png live.png
//   pixelsync --canvas abc123 paint 3 3 "#FF4500"
//   pixelsync --canvas abc123 fill 1 1 20 20 --color "#FFFFFF"
//   pixelsync --canvas abc123 import logo.png 10 10 40 30
//   pixelsync --memory 32x32 transpose --yes
//   pixelsync --canvas abc123 snapshot grid.pxs --png grid.png
//   pixelsync --store-url https://pb.example.org --canvas abc123 --save-settings watch
//
// `--memory WxH` runs against an in-process store seeded with a blank canvas,
// which is handy for trying things out without a backend.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};

use crate::color::Color;
use crate::dispatch::DispatchReport;
use crate::error::{Result, SyncError};
use crate::remote::{HttpStore, MemoryStore, RemoteStore};
use crate::selection::CanvasRange;
use crate::session::{BulkJob, SelectionInput, SessionHandle};
use crate::settings::Settings;
use crate::snapshot::save_snapshot;
use crate::surface::{LogSurface, NullSurface, PaintSink, RasterSurface};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// PixelSync shared-canvas client.
#[derive(Parser, Debug)]
#[command(
    name = "pixelsync",
    about = "Synchronize, edit and bulk-update a shared pixel canvas",
    long_about = "Keeps a local mirror of a remote pixel canvas in sync and applies\n\
                  single edits, area fills, image imports and transposition in paced\n\
                  batches.\n\n\
                  Example:\n  \
                  pixelsync --canvas abc123 fill 1 1 20 20\n  \
                  pixelsync --memory 16x16 import logo.png 1 1 16 16"
)]
pub struct CliArgs {
    /// Settings file (defaults to the platform config location).
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Backend base URL, overrides `store_url`.
    #[arg(long, value_name = "URL", global = true)]
    pub store_url: Option<String>,

    /// Use an in-process store with a blank WxH canvas instead of a backend.
    #[arg(long, value_name = "WxH", value_parser = parse_dims, global = true)]
    pub memory: Option<(u32, u32)>,

    /// Canvas id, overrides `canvas_id`.
    #[arg(long, value_name = "ID", global = true)]
    pub canvas: Option<String>,

    #[arg(long, value_name = "N", global = true)]
    pub chunk_size: Option<usize>,

    #[arg(long, value_name = "MS", global = true)]
    pub chunk_delay_ms: Option<u64>,

    /// Surface pixels per canvas cell (PNG output).
    #[arg(long, value_name = "N", global = true)]
    pub scale: Option<u32>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write the resolved settings (file + flags) back to the settings file.
    #[arg(long, global = true)]
    pub save_settings: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream remote changes until Ctrl-C.
    Watch {
        /// Write the final canvas to this PNG on exit.
        #[arg(long, value_name = "FILE")]
        png: Option<PathBuf>,
    },
    /// Paint a single pixel.
    Paint {
        x: u32,
        y: u32,
        #[arg(value_parser = parse_color)]
        color: Color,
    },
    /// Fill an inclusive rectangle with one color.
    Fill {
        x0: i64,
        y0: i64,
        x1: i64,
        y1: i64,
        #[arg(long, default_value = "#FFFFFF", value_parser = parse_color)]
        color: Color,
    },
    /// Quantize an image to the palette and upload it into a rectangle.
    Import {
        image: PathBuf,
        x0: i64,
        y0: i64,
        x1: i64,
        y1: i64,
    },
    /// Rewrite the canvas as its transpose. Can not be undone.
    Transpose {
        /// Confirm the operation.
        #[arg(long)]
        yes: bool,
    },
    /// Save the current grid to a .pxs snapshot.
    Snapshot {
        output: PathBuf,
        /// Also render the grid to a PNG.
        #[arg(long, value_name = "FILE")]
        png: Option<PathBuf>,
    },
}

fn parse_dims(s: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got '{s}'"))?;
    let w: u32 = w.trim().parse().map_err(|_| format!("invalid width '{w}'"))?;
    let h: u32 = h.trim().parse().map_err(|_| format!("invalid height '{h}'"))?;
    if w == 0 || h == 0 {
        return Err("canvas dimensions must be positive".to_string());
    }
    Ok((w, h))
}

fn parse_color(s: &str) -> std::result::Result<Color, String> {
    Color::from_hex(s).map_err(|e| e.to_string())
}

// ============================================================================
// Public entry point
// ============================================================================

/// Resolve settings, start logging and run the subcommand.
/// `0` = success, `1` = any error.
pub async fn run(args: CliArgs) -> ExitCode {
    let settings = resolve_settings(&args);
    crate::logger::init(settings.log_level);
    if args.save_settings {
        persist_settings(&settings, args.config.as_deref());
    }

    let result = match args.memory {
        Some((w, h)) => {
            let canvas_id = if settings.canvas_id.is_empty() { "demo".to_string() } else { settings.canvas_id.clone() };
            let store = Arc::new(MemoryStore::with_blank_canvas(&canvas_id, w, h));
            let settings = Settings { canvas_id, ..settings };
            execute(store, &settings, args.command).await
        }
        None => match HttpStore::new(&settings.store_url, settings.request_timeout()) {
            Ok(store) => execute(Arc::new(store), &settings, args.command).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            if let Some(path) = crate::logger::log_path() {
                eprintln!("  (details in {})", path.display());
            }
            ExitCode::FAILURE
        }
    }
}

fn resolve_settings(args: &CliArgs) -> Settings {
    let mut settings = match &args.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    if let Some(url) = &args.store_url {
        settings.store_url = url.clone();
    }
    if let Some(canvas) = &args.canvas {
        settings.canvas_id = canvas.clone();
    }
    if let Some(n) = args.chunk_size {
        settings.chunk_size = n;
    }
    if let Some(ms) = args.chunk_delay_ms {
        settings.chunk_delay_ms = ms;
    }
    if let Some(scale) = args.scale.filter(|&s| s > 0) {
        settings.scale = scale;
    }
    if args.verbose {
        settings.log_level = log::LevelFilter::Debug;
    }
    settings
}

/// Save to `--config` when given, else to the platform location.
fn persist_settings(settings: &Settings, config: Option<&Path>) {
    let Some(path) = config else {
        settings.save();
        return;
    };
    match settings.save_to(path) {
        Ok(()) => log::info!("Saved settings to {}", path.display()),
        Err(e) => log::warn!("Could not save settings to {}: {}", path.display(), e),
    }
}

async fn open<S: RemoteStore, P: PaintSink>(store: &Arc<S>, settings: &Settings, surface: P) -> Result<SessionHandle<S>> {
    if settings.canvas_id.is_empty() {
        return Err(SyncError::not_found("no canvas id given (use --canvas or set canvas_id)"));
    }
    SessionHandle::open(Arc::clone(store), &settings.canvas_id, settings, surface).await
}

async fn execute<S: RemoteStore>(store: Arc<S>, settings: &Settings, command: Command) -> Result<()> {
    match command {
        Command::Watch { png } => {
            let raster = match &png {
                Some(_) => Some(raster_for(&store, settings).await?),
                None => None,
            };
            let surface: Box<dyn PaintSink> = match &raster {
                Some(r) => Box::new((LogSurface, r.clone())),
                None => Box::new(LogSurface),
            };
            let session = open(&store, settings, surface).await?;
            println!("Watching canvas {} ({}x{}), Ctrl-C to stop", session.canvas_id(), session.meta().width, session.meta().height);
            let _ = tokio::signal::ctrl_c().await;
            let stats = session.stats().await?;
            session.close().await?;
            println!(
                "{} events applied, {} stale, {} ignored",
                stats.remote_applied, stats.remote_stale, stats.remote_ignored
            );
            if let (Some(path), Some(raster)) = (png, raster) {
                raster.save_png(&path)?;
                println!("Saved {}", path.display());
            }
        }
        Command::Paint { x, y, color } => {
            let session = open(&store, settings, NullSurface).await?;
            let edit = session.paint(x, y, color).await?;
            session.close().await?;
            match edit.mutation {
                Some(_) => println!("Painted ({}, {}) {}", x, y, color),
                None => println!("Painted ({}, {}) {} locally; no remote record", x, y, color),
            }
        }
        Command::Fill { x0, y0, x1, y1, color } => {
            let session = open(&store, settings, NullSurface).await?;
            session.select(SelectionInput::Cells(CanvasRange::from_corners(x0, y0, x1, y1))).await?;
            let job = session.fill(color).await?;
            let report = await_job(job).await?;
            session.close().await?;
            print_report("Fill", &report);
        }
        Command::Import { image, x0, y0, x1, y1 } => {
            let bytes = std::fs::read(&image)
                .map_err(|e| SyncError::DecodeFailure(format!("{}: {}", image.display(), e)))?;
            let session = open(&store, settings, NullSurface).await?;
            session.select(SelectionInput::Cells(CanvasRange::from_corners(x0, y0, x1, y1))).await?;
            let job = session.import(&bytes).await?;
            let report = await_job(job).await?;
            session.close().await?;
            print_report("Import", &report);
        }
        Command::Transpose { yes } => {
            let session = open(&store, settings, NullSurface).await?;
            let job = session.transpose(yes).await?;
            let report = await_job(job).await?;
            session.close().await?;
            print_report("Transpose", &report);
        }
        Command::Snapshot { output, png } => {
            let raster = raster_for(&store, settings).await?;
            let session = open(&store, settings, raster.clone()).await?;
            let snapshot = session.snapshot().await?;
            session.close().await?;
            save_snapshot(&snapshot, &output)?;
            println!("Saved {} pixels to {}", snapshot.pixels.len(), output.display());
            if let Some(path) = png {
                raster.save_png(&path)?;
                println!("Saved {}", path.display());
            }
        }
    }
    Ok(())
}

async fn raster_for<S: RemoteStore>(store: &Arc<S>, settings: &Settings) -> Result<RasterSurface> {
    let meta = store.fetch_canvas_meta(&settings.canvas_id).await?;
    Ok(RasterSurface::new(meta, settings.scale))
}

/// Wait for a bulk job; Ctrl-C cancels it after the in-flight chunk.
async fn await_job(job: BulkJob) -> Result<DispatchReport> {
    let started = Instant::now();
    println!("Dispatching {} updates…", job.total());
    let cancel = job.cancel_token();
    let wait = job.wait();
    tokio::pin!(wait);
    let report = tokio::select! {
        report = &mut wait => report?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling after the current chunk…");
            cancel.cancel();
            wait.await?
        }
    };
    log::info!("Bulk job took {:.2}s", started.elapsed().as_secs_f64());
    Ok(report)
}

fn print_report(label: &str, report: &DispatchReport) {
    println!(
        "{}: {} chunks, {} updated, {} failed, {} skipped{}",
        label,
        report.chunks,
        report.succeeded,
        report.failed,
        report.skipped,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for (id, e) in report.failures.iter().take(10) {
        eprintln!("  {}: {}", id, e);
    }
    if report.failures.len() > 10 {
        eprintln!("  … and {} more", report.failures.len() - 10);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_parse() {
        assert_eq!(parse_dims("32x16"), Ok((32, 16)));
        assert_eq!(parse_dims("8X8"), Ok((8, 8)));
        assert!(parse_dims("0x5").is_err());
        assert!(parse_dims("32").is_err());
    }

    #[test]
    fn flags_override_settings() {
        let args = CliArgs::parse_from([
            "pixelsync",
            "--config",
            "/nonexistent/pixelsync_settings.cfg",
            "--canvas",
            "abc",
            "--chunk-size",
            "3",
            "--verbose",
            "fill",
            "1",
            "1",
            "4",
            "4",
        ]);
        let settings = resolve_settings(&args);
        assert_eq!(settings.canvas_id, "abc");
        assert_eq!(settings.chunk_size, 3);
        assert_eq!(settings.chunk_delay_ms, 100);
        assert_eq!(settings.log_level, log::LevelFilter::Debug);
        match args.command {
            Command::Fill { color, x1, .. } => {
                assert_eq!(color, Color::WHITE);
                assert_eq!(x1, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn save_settings_persists_flag_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pixelsync_settings.cfg");
        let path_arg = path.to_str().unwrap();
        let args = CliArgs::parse_from([
            "pixelsync",
            "--config",
            path_arg,
            "--canvas",
            "saved",
            "--chunk-delay-ms",
            "250",
            "--save-settings",
            "snapshot",
            "out.pxs",
        ]);
        assert!(args.save_settings);
        let settings = resolve_settings(&args);
        persist_settings(&settings, args.config.as_deref());

        let reloaded = Settings::load_from(&path);
        assert_eq!(reloaded, settings);
        assert_eq!(reloaded.canvas_id, "saved");
        assert_eq!(reloaded.chunk_delay_ms, 250);
    }

    #[test]
    fn bad_color_is_rejected() {
        assert!(CliArgs::try_parse_from(["pixelsync", "paint", "1", "1", "red"]).is_err());
    }

    #[tokio::test]
    async fn memory_paint_round_trip() {
        let store = Arc::new(MemoryStore::with_blank_canvas("demo", 4, 4));
        let settings = Settings { canvas_id: "demo".into(), ..Settings::default() };
        execute(Arc::clone(&store), &settings, Command::Paint { x: 2, y: 3, color: Color::BLACK })
            .await
            .unwrap();
        assert_eq!(store.color_at("demo", 2, 3), Some(Color::BLACK));
    }
}
