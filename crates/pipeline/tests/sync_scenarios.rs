//! End-to-end sync runs against an in-process composite source.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use chrono::{DateTime, TimeZone, Utc};
use ndvisync_algorithms::mosaic::list_tiles;
use ndvisync_cloud::composite::INDEX_BAND;
use ndvisync_cloud::{BBox, CloudError, CompositeHandle, CompositeRequest, CompositeSource, ExportTarget};
use ndvisync_core::io::write_geotiff;
use ndvisync_core::{GeoTransform, Raster, CRS, INDEX_NODATA};
use ndvisync_pipeline::{
    MarkerCache, MemoryMarkerCache, MemoryRunLock, RecordStore, RetryPolicy, RunCoordinator, RunLock, RunOutcome,
    RunTrigger, SkipReason, SyncConfig, SyncPipeline, LAST_SYNC_KEY,
};

const VALUE: f32 = 0.42;

#[derive(Clone)]
struct ConstantHandle {
    value: f32,
}

impl CompositeHandle for ConstantHandle {
    fn band_names(&self) -> Vec<String> {
        vec![INDEX_BAND.to_string()]
    }

    fn scene_count(&self) -> usize {
        3
    }

    async fn export_clip(&self, cell: &BBox, target: &ExportTarget, dest: &Path) -> ndvisync_cloud::Result<()> {
        // One extra pixel on every side so neighbouring tiles overlap.
        let pad = target.resolution;
        let (min_x, min_y, max_x, max_y) = cell.to_tuple();
        let bounds = (min_x - pad, min_y - pad, max_x + pad, max_y + pad);
        let (gt, cols, rows) = GeoTransform::for_extent(bounds, target.resolution);
        let mut raster = Raster::filled(rows, cols, self.value);
        raster.set_transform(gt);
        raster.set_crs(Some(CRS::from_epsg(target.epsg)));
        raster.set_nodata(Some(INDEX_NODATA));
        write_geotiff(&raster, dest, None)?;
        Ok(())
    }
}

/// Answers every query with a constant composite, or with no scenes.
struct FakeSource {
    empty: bool,
    queries: Arc<AtomicUsize>,
}

impl FakeSource {
    fn constant() -> Self {
        Self {
            empty: false,
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn empty() -> Self {
        Self {
            empty: true,
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn counter(&self) -> Arc<AtomicUsize> {
        self.queries.clone()
    }
}

impl CompositeSource for FakeSource {
    type Handle = ConstantHandle;

    async fn query_composite(&self, request: &CompositeRequest) -> ndvisync_cloud::Result<ConstantHandle> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.empty {
            return Err(CloudError::NoScenes {
                start: request.start.to_rfc3339(),
                end: request.end.to_rfc3339(),
            });
        }
        Ok(ConstantHandle { value: VALUE })
    }
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        grid_rows: 2,
        grid_cols: 2,
        target_epsg: 4326,
        resolution: 0.05,
        workers: 4,
        output_root: root.join("ndvi"),
        database: root.join("ndvisync.db"),
        lock_dir: root.join("locks"),
        ..Default::default()
    }
}

fn coordinator(cfg: &SyncConfig) -> RunCoordinator<MemoryRunLock, Arc<MemoryMarkerCache>> {
    RunCoordinator::new(
        MemoryRunLock::new(),
        Arc::new(MemoryMarkerCache::new()),
        cfg.cooldown(),
        cfg.retry,
    )
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 12, 2, 0, 0).unwrap()
}

#[tokio::test]
async fn test_full_run_commits_record() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let pipeline = SyncPipeline::new(cfg.clone(), FakeSource::constant(), RecordStore::open_in_memory().unwrap());
    let coordinator = coordinator(&cfg);

    let report = coordinator
        .run_at(RunTrigger::Scheduled, t0(), |_| pipeline.run_once(t0()))
        .await;

    let summary = match report.outcome {
        RunOutcome::Committed(summary) => summary,
        other => panic!("expected commit, got {other:?}"),
    };
    assert!(report.failures.is_empty());
    assert_eq!(summary.tiles, 4);
    assert_eq!(summary.scene_count, 3);
    assert!(summary.mosaic.exists());

    let record = &summary.record;
    assert_eq!(record.name, "henan_ndvi_20240612");
    assert_relative_eq!(record.mean_value.unwrap(), VALUE as f64, epsilon = 1e-6);
    assert_relative_eq!(record.min_value.unwrap(), VALUE as f64, epsilon = 1e-6);
    assert_relative_eq!(record.max_value.unwrap(), VALUE as f64, epsilon = 1e-6);
    assert!(record.thumbnail.as_ref().is_some_and(|png| !png.is_empty()));
    assert!(record.coverage.is_some());

    let run_dir = cfg.output_root.join(&record.name);
    assert_eq!(list_tiles(&run_dir).unwrap().len(), 4);
    assert!(run_dir.join("metadata.json").exists());

    assert!(coordinator.cache().get(LAST_SYNC_KEY).unwrap().is_some());
    assert!(!coordinator.lock().is_held());
}

#[tokio::test]
async fn test_rerun_same_day_keeps_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let pipeline = SyncPipeline::new(cfg.clone(), FakeSource::constant(), RecordStore::open_in_memory().unwrap());

    let first = pipeline.run_once(t0()).await.unwrap();
    let second = pipeline.run_once(t0() + chrono::Duration::hours(3)).await.unwrap();

    assert_eq!(first.record.name, second.record.name);
    assert_eq!(first.record.processing_date, second.record.processing_date);
    assert_eq!(pipeline.store().count().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_data_retries_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let pipeline = SyncPipeline::new(cfg.clone(), FakeSource::empty(), RecordStore::open_in_memory().unwrap());
    let coordinator = coordinator(&cfg);

    let report = coordinator
        .run_at(RunTrigger::Scheduled, t0(), |_| pipeline.run_once(t0()))
        .await;

    assert!(report.is_failed());
    assert_eq!(report.failures.len(), 4);
    assert_eq!(report.failures[0].retry_in, Some(Duration::from_secs(60)));
    assert_eq!(report.failures[1].retry_in, Some(Duration::from_secs(120)));
    assert_eq!(report.failures[3].retry_in, None);
    assert!(report.failures[0].error.contains("no imagery"));

    assert_eq!(pipeline.store().count().unwrap(), 0);
    assert!(coordinator.cache().get(LAST_SYNC_KEY).unwrap().is_none());
    assert!(!coordinator.lock().is_held());
}

#[tokio::test]
async fn test_lock_held_skips_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let source = FakeSource::constant();
    let queries = source.counter();
    let pipeline = SyncPipeline::new(cfg.clone(), source, RecordStore::open_in_memory().unwrap());
    let coordinator = coordinator(&cfg);

    let held = coordinator.lock().clone();
    let guard = held.try_acquire().unwrap().expect("lock free");

    let report = coordinator
        .run_at(RunTrigger::Scheduled, t0(), |_| pipeline.run_once(t0()))
        .await;

    assert!(matches!(report.outcome, RunOutcome::Skipped(SkipReason::LockHeld)));
    assert_eq!(queries.load(Ordering::SeqCst), 0);
    assert!(!cfg.output_root.exists());
    assert!(coordinator.cache().keys().is_empty());

    drop(guard);
    assert!(coordinator.lock().try_acquire().unwrap().is_some());
}

#[tokio::test]
async fn test_cooldown_gates_scheduled_runs() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let pipeline = SyncPipeline::new(cfg.clone(), FakeSource::constant(), RecordStore::open_in_memory().unwrap());
    let coordinator = coordinator(&cfg);
    let window = cfg.cooldown();

    coordinator.cache().set(LAST_SYNC_KEY, t0()).unwrap();

    let half = t0() + chrono::Duration::from_std(window / 2).unwrap();
    let report = coordinator
        .run_at(RunTrigger::Scheduled, half, |_| pipeline.run_once(half))
        .await;
    match report.outcome {
        RunOutcome::Skipped(SkipReason::Cooldown { last_run, .. }) => assert_eq!(last_run, t0()),
        other => panic!("expected cooldown skip, got {other:?}"),
    }
    assert_eq!(pipeline.store().count().unwrap(), 0);
    assert!(!coordinator.lock().is_held());
    assert!(coordinator.lock().try_acquire().unwrap().is_some());

    let later = t0() + chrono::Duration::from_std(window + window / 2).unwrap();
    let report = coordinator
        .run_at(RunTrigger::Scheduled, later, |_| pipeline.run_once(later))
        .await;
    assert!(report.is_committed());
    assert_eq!(coordinator.cache().get(LAST_SYNC_KEY).unwrap(), Some(later));
}

#[tokio::test]
async fn test_first_run_bypasses_cooldown_once() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let source = FakeSource::constant();
    let pipeline = SyncPipeline::new(cfg.clone(), source, RecordStore::open_in_memory().unwrap());
    let coordinator = coordinator(&cfg);

    coordinator.cache().set(LAST_SYNC_KEY, t0()).unwrap();
    let soon = t0() + chrono::Duration::hours(1);

    let first = coordinator
        .run_at(RunTrigger::FirstRun, soon, |_| pipeline.run_once(soon))
        .await;
    assert!(first.is_committed());

    let again = coordinator
        .run_at(RunTrigger::FirstRun, soon, |_| pipeline.run_once(soon))
        .await;
    assert!(again.is_skipped());
}

#[tokio::test]
async fn test_no_data_leaves_no_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let source = FakeSource::empty();
    let pipeline = SyncPipeline::new(cfg.clone(), source, RecordStore::open_in_memory().unwrap());

    assert!(pipeline.fetch_tiles(t0()).await.is_err());
    assert!(!cfg.output_root.exists());
}

#[tokio::test]
async fn test_query_count_matches_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SyncConfig {
        retry: RetryPolicy {
            max_retries: 1,
            base_delay_secs: 0,
            max_delay_secs: 0,
        },
        ..config(dir.path())
    };
    let source = FakeSource::empty();
    let queries = source.counter();
    let pipeline = SyncPipeline::new(cfg.clone(), source, RecordStore::open_in_memory().unwrap());
    let coordinator = coordinator(&cfg);

    let report = coordinator
        .run_at(RunTrigger::Scheduled, t0(), |_| pipeline.run_once(t0()))
        .await;
    assert!(report.is_failed());
    assert_eq!(report.failures.len(), 2);
    assert_eq!(queries.load(Ordering::SeqCst), 2);
}
