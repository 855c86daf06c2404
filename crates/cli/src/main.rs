//! ndvisync CLI - scheduled NDVI ingestion from satellite composites

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ndvisync_algorithms::imagery::{normalized_difference_with, to_index_raster, NormalizedDifferenceParams};
use ndvisync_algorithms::mosaic::{list_tiles, merge_tiles, MergePath};
use ndvisync_algorithms::statistics::{window_statistics, DEFAULT_WINDOW_CAP};
use ndvisync_core::io::{read_geotiff, write_geotiff, GeoTiffOptions};
use ndvisync_core::Raster;
use ndvisync_pipeline::{
    stac_source, FileRunLock, RecordStore, RunCoordinator, RunOutcome, RunReport, RunTrigger, SkipReason,
    SqliteMarkerCache, StacSource, SyncConfig, SyncPipeline, SyncSummary,
};

/// Lock file name shared by every worker of one deployment
const LOCK_NAME: &str = "ndvi_sync";

/// Added to the NDVI denominator by `process-index`
const PROCESS_EPSILON: f64 = 1e-10;

// ─── CLI structure ──────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ndvisync")]
#[command(author, version, about = "Scheduled NDVI ingestion from satellite composites", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file; built-in defaults apply when omitted
    #[arg(short, long, global = true, env = "NDVISYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one guarded sync: lock, cooldown, fetch, merge, persist
    Sync {
        /// Treat this as the one-time startup run (bypasses the cooldown once)
        #[arg(long)]
        first_run: bool,
    },
    /// Fire the startup run, then a scheduled run every N hours
    Watch {
        #[arg(long, default_value = "168")]
        every_hours: u64,
    },
    /// Download the composite tiles and metadata without merging
    FetchComposite {
        /// Output root directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Service-account key file
        #[arg(long)]
        service_account: Option<PathBuf>,
    },
    /// Compute NDVI from B04/B08 bands in each sub-directory of the input
    ProcessIndex {
        /// Directory of scene sub-directories
        #[arg(short, long)]
        input: PathBuf,
        /// Output GeoTIFF
        #[arg(short, long)]
        output: PathBuf,
        /// DEFLATE level, 1 (fast) to 9 (best)
        #[arg(long, default_value = "6")]
        compress: u32,
    },
    /// Merge every tile of a directory into one raster
    Merge {
        /// Tile directory
        input: PathBuf,
        /// Output file
        output: PathBuf,
    },
    /// Window statistics of an index raster
    Stats {
        /// Input raster
        input: PathBuf,
        /// Window side length in pixels
        #[arg(long, default_value_t = DEFAULT_WINDOW_CAP)]
        cap: usize,
    },
    /// List the most recent index records
    List {
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Zip a record's tiles and metadata
    Bundle {
        /// Record name, e.g. henan_ndvi_20240612
        name: String,
        /// Output zip file
        #[arg(short, long)]
        output: PathBuf,
    },
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn done(name: &str, path: &Path, elapsed: Duration) {
    println!("{} saved to: {}", name, path.display());
    println!("  Processing time: {:.2?}", elapsed);
}

fn fmt_stat(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.4}", v))
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path).context("Failed to load config"),
        None => Ok(SyncConfig::default()),
    }
}

fn open_pipeline(cfg: &SyncConfig) -> Result<SyncPipeline<StacSource>> {
    cfg.validate().context("Invalid configuration")?;
    let source = stac_source(cfg).context("Failed to set up imagery source")?;
    let store = RecordStore::open(&cfg.database)
        .with_context(|| format!("Failed to open database {}", cfg.database.display()))?;
    Ok(SyncPipeline::new(cfg.clone(), source, store))
}

type Coordinator = RunCoordinator<FileRunLock, SqliteMarkerCache>;

fn open_coordinator(cfg: &SyncConfig) -> Result<Coordinator> {
    let cache = SqliteMarkerCache::open(&cfg.database).context("Failed to open marker cache")?;
    Ok(RunCoordinator::new(
        FileRunLock::new(&cfg.lock_dir, LOCK_NAME),
        cache,
        cfg.cooldown(),
        cfg.retry,
    ))
}

fn report_run(report: &RunReport<SyncSummary>) -> Result<()> {
    match &report.outcome {
        RunOutcome::Committed(summary) => {
            let record = &summary.record;
            println!("Record {} committed", record.name);
            println!("  Tiles: {} from {} scenes", summary.tiles, summary.scene_count);
            println!("  Mosaic: {}", summary.mosaic.display());
            println!(
                "  NDVI min/max/mean: {} / {} / {}",
                fmt_stat(record.min_value),
                fmt_stat(record.max_value),
                fmt_stat(record.mean_value)
            );
            if !report.failures.is_empty() {
                println!("  Attempts: {}", report.failures.len() + 1);
            }
            Ok(())
        }
        RunOutcome::Skipped(SkipReason::LockHeld) => {
            println!("Skipped: another sync holds the run lock");
            Ok(())
        }
        RunOutcome::Skipped(SkipReason::Cooldown { last_run, remaining }) => {
            println!(
                "Skipped: last sync at {}, next allowed in {:.1} h",
                last_run,
                remaining.as_secs_f64() / 3600.0
            );
            Ok(())
        }
        RunOutcome::Failed(e) => {
            for failure in &report.failures {
                eprintln!("  attempt {}: {}", failure.attempt, failure.error);
            }
            anyhow::bail!("Sync failed after {} attempt(s): {}", report.failures.len().max(1), e)
        }
    }
}

// ─── process-index ──────────────────────────────────────────────────────

/// Red and NIR band files of one scene directory
#[derive(Debug, Clone, PartialEq)]
struct BandPair {
    scene: String,
    red: PathBuf,
    nir: PathBuf,
}

fn band_file(dir: &Path, tag: &str) -> Result<Option<PathBuf>> {
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let is_tif = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff"));
        if is_tif && name.contains(tag) {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches.into_iter().next())
}

/// Scene sub-directories holding both bands, plus the names of those
/// missing one.
fn find_band_pairs(input: &Path) -> Result<(Vec<BandPair>, Vec<String>)> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(input).with_context(|| format!("Failed to read {}", input.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();

    let mut pairs = Vec::new();
    let mut incomplete = Vec::new();
    for dir in dirs {
        let scene = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match (band_file(&dir, "B04")?, band_file(&dir, "B08")?) {
            (Some(red), Some(nir)) => pairs.push(BandPair { scene, red, nir }),
            _ => incomplete.push(scene),
        }
    }
    Ok((pairs, incomplete))
}

/// Output path of one scene: `output` itself when there is a single scene,
/// `<stem>_<scene>.tif` beside it otherwise.
fn scene_output(output: &Path, scene: &str, total: usize) -> PathBuf {
    if total <= 1 {
        return output.to_path_buf();
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ndvi".to_string());
    output.with_file_name(format!("{}_{}.tif", stem, scene))
}

fn process_scene(pair: &BandPair, dest: &Path, level: u32) -> Result<()> {
    let red: Raster<f64> = read_geotiff(&pair.red, None)
        .with_context(|| format!("Failed to read red band {}", pair.red.display()))?;
    let nir: Raster<f64> = read_geotiff(&pair.nir, None)
        .with_context(|| format!("Failed to read NIR band {}", pair.nir.display()))?;

    let index = normalized_difference_with(
        &nir,
        &red,
        &NormalizedDifferenceParams {
            epsilon: PROCESS_EPSILON,
        },
    )
    .context("Failed to compute NDVI")?;

    write_geotiff(
        &to_index_raster(&index),
        dest,
        Some(GeoTiffOptions::deflate(level.clamp(1, 9))),
    )
    .context("Failed to write output")?;
    Ok(())
}

// ─── Main ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    let cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync { first_run } => {
            let pipeline = open_pipeline(&cfg)?;
            let coordinator = open_coordinator(&cfg)?;
            let trigger = if first_run {
                RunTrigger::FirstRun
            } else {
                RunTrigger::Scheduled
            };
            let start = Instant::now();
            let report = pipeline.sync(&coordinator, trigger).await;
            report_run(&report)?;
            println!("  Processing time: {:.2?}", start.elapsed());
        }

        Commands::Watch { every_hours } => {
            let pipeline = open_pipeline(&cfg)?;
            let coordinator = open_coordinator(&cfg)?;
            let period = Duration::from_secs(every_hours.max(1) * 3600);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(every_hours, "watching");
            let mut trigger = RunTrigger::FirstRun;
            loop {
                ticker.tick().await;
                let report = pipeline.sync(&coordinator, trigger).await;
                if let Err(e) = report_run(&report) {
                    warn!(error = %e, "scheduled run failed");
                }
                trigger = RunTrigger::Scheduled;
            }
        }

        Commands::FetchComposite {
            output,
            service_account,
        } => {
            let mut cfg = cfg;
            if let Some(output) = output {
                cfg.output_root = output;
            }
            if service_account.is_some() {
                cfg.service_account = service_account;
            }
            cfg.validate().context("Invalid configuration")?;
            let source = stac_source(&cfg).context("Failed to set up imagery source")?;
            let store = RecordStore::open_in_memory().context("Failed to open scratch store")?;
            let pipeline = SyncPipeline::new(cfg, source, store);

            let pb = spinner("Fetching composite tiles...");
            let start = Instant::now();
            let fetched = pipeline
                .fetch_tiles(Utc::now())
                .await
                .context("Failed to fetch composite")?;
            pb.finish_and_clear();

            println!("{} tiles from {} scenes", fetched.tiles.len(), fetched.scene_count);
            done("Composite", &fetched.run_dir, start.elapsed());
        }

        Commands::ProcessIndex {
            input,
            output,
            compress,
        } => {
            let (pairs, incomplete) = find_band_pairs(&input)?;
            for scene in &incomplete {
                warn!(scene = %scene, "missing B04 or B08 band, skipped");
            }
            if pairs.is_empty() {
                anyhow::bail!("No sub-directory of {} holds both B04 and B08 bands", input.display());
            }
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).context("Failed to create output directory")?;
            }

            for pair in &pairs {
                let dest = scene_output(&output, &pair.scene, pairs.len());
                let pb = spinner(&format!("Processing {}...", pair.scene));
                let start = Instant::now();
                process_scene(pair, &dest, compress)?;
                pb.finish_and_clear();
                done("NDVI", &dest, start.elapsed());
            }
        }

        Commands::Merge { input, output } => {
            let tiles = list_tiles(&input).context("Failed to list tiles")?;
            let pb = spinner(&format!("Merging {} tiles...", tiles.len()));
            let start = Instant::now();
            let report = merge_tiles(&tiles, &output).context("Failed to merge tiles")?;
            pb.finish_and_clear();

            let path = match report.path {
                MergePath::Virtual => "virtual mosaic",
                MergePath::Fallback => "pixel-copy fallback",
            };
            println!("Merged {} tiles ({}), {} x {}", report.tiles_used, path, report.cols, report.rows);
            if report.tiles_skipped > 0 {
                println!("  Skipped: {} unreadable tiles", report.tiles_skipped);
            }
            done("Mosaic", &output, start.elapsed());
        }

        Commands::Stats { input, cap } => {
            let stats = window_statistics(&input, cap)
                .context("Failed to compute statistics")?
                .sanitized();
            println!("File: {}", input.display());
            println!("Window: {} x {}", stats.window.1, stats.window.0);
            println!("  Min: {}", fmt_stat(stats.min));
            println!("  Max: {}", fmt_stat(stats.max));
            println!("  Mean: {}", fmt_stat(stats.mean));
            println!("  Valid cells: {}", stats.valid_count);
        }

        Commands::List { limit } => {
            let store = RecordStore::open(&cfg.database).context("Failed to open database")?;
            let records = store.list_recent(limit).context("Failed to list records")?;
            if records.is_empty() {
                println!("No records in {}", cfg.database.display());
            }
            for record in records {
                println!(
                    "{}  {}  mean={}  dir={}",
                    record.name,
                    record.acquisition_date,
                    fmt_stat(record.mean_value),
                    record.directory.display()
                );
            }
        }

        Commands::Bundle { name, output } => {
            let store = RecordStore::open(&cfg.database).context("Failed to open database")?;
            let pb = spinner("Writing bundle...");
            let files = store
                .export_bundle(&name, &cfg.output_root, &output)
                .with_context(|| format!("Failed to bundle {}", name))?;
            pb.finish_and_clear();
            println!("{} files bundled into: {}", files, output.display());
        }
    }

    Ok(())
}
