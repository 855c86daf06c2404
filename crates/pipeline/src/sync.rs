//! One sync run, end to end
//!
//! composite query -> fishnet -> tile download + validation -> merge ->
//! statistics, coverage and thumbnail -> record upsert.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geo_types::{Polygon, Rect};
use ndvisync_algorithms::fishnet::fishnet_rect;
use ndvisync_algorithms::mosaic::{merge_tiles, MergePath, MergeReport};
use ndvisync_algorithms::statistics::{coverage_polygon, window_statistics, IndexStatistics};
use ndvisync_cloud::auth::{CloudAuth, NoAuth, ServiceAccountAuth};
use ndvisync_cloud::composite::CogAssetReader;
use ndvisync_cloud::http::HttpClient;
use ndvisync_cloud::reproject::Projection;
use ndvisync_cloud::{
    CogReaderOptions, CompositeHandle, CompositeRequest, CompositeSource, ExportTarget,
    StacClient, StacClientOptions, StacCompositeSource,
};
use ndvisync_colormap::{render_thumbnail, ThumbnailOptions};
use ndvisync_core::io::{probe_geotiff, read_geotiff};
use ndvisync_core::{Raster, CRS};
use serde_json::json;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::coordinator::{RunCoordinator, RunReport, RunTrigger};
use crate::cache::MarkerCache;
use crate::downloader::{clean_partial_tiles, download_tiles, validate_tiles, DownloadOptions, TileArtifact};
use crate::error::{Result, SyncError};
use crate::lock::RunLock;
use crate::metadata::{write_metadata, RunMetadata};
use crate::store::{record_name, IndexRecord, RecordStore};

/// Name of the merged raster inside a run's `mosaic/` sub-directory
pub const MOSAIC_FILE: &str = "mosaic.tif";

/// The production composite source: STAC search plus COG range reads.
pub type StacSource = StacCompositeSource<StacClient, CogAssetReader>;

/// Build the STAC-backed source described by `config`.
pub fn stac_source(config: &SyncConfig) -> Result<StacSource> {
    let auth: Arc<dyn CloudAuth> = match &config.service_account {
        Some(path) => Arc::new(ServiceAccountAuth::from_key_file(path)?),
        None => Arc::new(NoAuth),
    };
    let client = StacClient::new(
        config.stac.catalog(),
        StacClientOptions {
            auth: auth.clone(),
            ..Default::default()
        },
    )?;
    let http = Arc::new(HttpClient::new(Duration::from_secs(60), 3)?);
    let reader = CogAssetReader::new(http, auth, CogReaderOptions::default());
    Ok(StacCompositeSource::new(
        Arc::new(client),
        Arc::new(reader),
        config.composite_options(),
    ))
}

/// Tiles of one run, validated and ready to merge
#[derive(Debug, Clone)]
pub struct FetchSummary {
    pub name: String,
    pub run_dir: PathBuf,
    pub request: CompositeRequest,
    pub scene_count: usize,
    pub tiles: Vec<TileArtifact>,
}

/// Result of a committed run
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub record: IndexRecord,
    pub merge: MergeReport,
    pub mosaic: PathBuf,
    pub tiles: usize,
    pub scene_count: usize,
}

pub struct SyncPipeline<S> {
    config: SyncConfig,
    source: S,
    store: Arc<RecordStore>,
}

impl<S: CompositeSource> SyncPipeline<S> {
    pub fn new(config: SyncConfig, source: S, store: RecordStore) -> Self {
        Self {
            config,
            source,
            store: Arc::new(store),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Query the composite and download the validated tile set into
    /// `<output_root>/<record name>/`.
    pub async fn fetch_tiles(&self, now: DateTime<Utc>) -> Result<FetchSummary> {
        let cfg = &self.config;
        let request = CompositeRequest::trailing(cfg.region(), now, cfg.window_days, cfg.cloud_threshold);
        let handle = self.source.query_composite(&request).await?;
        let scene_count = handle.scene_count();
        info!(scenes = scene_count, start = %request.start, end = %request.end, "composite ready");

        let cells = fishnet_rect(Rect::from(cfg.region()), &CRS::wgs84(), &cfg.fishnet_params())?;
        let name = record_name(&cfg.region_name, now.date_naive());
        let run_dir = cfg.output_root.join(&name);

        clean_partial_tiles(&run_dir)?;
        write_metadata(
            &run_dir,
            &RunMetadata {
                generated_at: now,
                source: cfg.stac.collection.clone(),
                bands: handle.band_names(),
                crs: CRS::from_epsg(cfg.target_epsg).to_string(),
                resolution: cfg.resolution,
                region: cfg.region_name.clone(),
                bbox: cfg.bbox,
                window_start: request.start,
                window_end: request.end,
                grid: [cfg.grid_rows, cfg.grid_cols],
                scene_count,
            },
        )?;

        let target = ExportTarget {
            epsg: cfg.target_epsg,
            resolution: cfg.resolution,
        };
        let options = DownloadOptions {
            workers: cfg.workers,
            retries: cfg.tile_retries,
            ..Default::default()
        };

        let downloaded = match download_tiles(&handle, &cells, &target, &run_dir, &options).await {
            Ok(mut tiles) => validate_tiles(&mut tiles, &run_dir, cells.len()).map(|()| tiles),
            Err(e) => Err(e),
        };
        let tiles = match downloaded {
            Ok(tiles) => tiles,
            Err(e) => {
                warn!(error = %e, "tile set rejected, cleaning up");
                clean_partial_tiles(&run_dir)?;
                return Err(e);
            }
        };

        Ok(FetchSummary {
            name,
            run_dir,
            request,
            scene_count,
            tiles,
        })
    }

    /// One full run at `now`: fetch, merge, summarize and persist.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SyncSummary> {
        let cfg = &self.config;
        let fetched = self.fetch_tiles(now).await?;

        let mosaic_dir = fetched.run_dir.join("mosaic");
        std::fs::create_dir_all(&mosaic_dir)?;
        let mosaic = mosaic_dir.join(MOSAIC_FILE);
        let paths: Vec<PathBuf> = fetched.tiles.iter().map(|t| t.path.clone()).collect();

        let MosaicProducts {
            merge,
            stats,
            coverage,
            thumbnail,
        } = {
            let mosaic = mosaic.clone();
            let cfg = cfg.clone();
            tokio::task::spawn_blocking(move || mosaic_products(&paths, &mosaic, &cfg))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))??
        };

        let record = IndexRecord {
            name: fetched.name.clone(),
            acquisition_date: now.date_naive(),
            processing_date: Utc::now(),
            resolution: cfg.resolution,
            directory: PathBuf::from(&fetched.name),
            min_value: stats.min,
            max_value: stats.max,
            mean_value: stats.mean,
            coverage: Some(coverage),
            thumbnail: Some(thumbnail),
            metadata: record_metadata(cfg, &fetched, &merge, &stats),
        };
        let store = Arc::clone(&self.store);
        let record = tokio::task::spawn_blocking(move || store.upsert(&record))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;

        info!(
            name = %record.name,
            tiles = fetched.tiles.len(),
            mean = ?record.mean_value,
            "sync run complete"
        );
        Ok(SyncSummary {
            record,
            merge,
            mosaic,
            tiles: fetched.tiles.len(),
            scene_count: fetched.scene_count,
        })
    }

    /// Run [`run_once`](Self::run_once) under `coordinator`, with a fresh
    /// clock reading per attempt.
    pub async fn sync<L, C>(&self, coordinator: &RunCoordinator<L, C>, trigger: RunTrigger) -> RunReport<SyncSummary>
    where
        L: RunLock,
        C: MarkerCache,
    {
        coordinator.run(trigger, |_| self.run_once(Utc::now())).await
    }
}

/// Everything derived from the merged raster
struct MosaicProducts {
    merge: MergeReport,
    stats: IndexStatistics,
    coverage: Polygon<f64>,
    thumbnail: Vec<u8>,
}

/// Merge `tiles` into `mosaic` and derive statistics, footprint and
/// thumbnail from it. Blocking; run off the async executor.
fn mosaic_products(tiles: &[PathBuf], mosaic: &std::path::Path, cfg: &SyncConfig) -> Result<MosaicProducts> {
    let merge = merge_tiles(tiles, mosaic)?;
    let stats = window_statistics(mosaic, cfg.stats_window_cap)?.sanitized();
    let coverage = mosaic_coverage(mosaic, cfg.target_epsg)?;

    let raster: Raster<f32> = read_geotiff(mosaic, None)?;
    let thumbnail = render_thumbnail(
        &raster,
        &ThumbnailOptions {
            max_size: cfg.thumbnail_size,
            ..Default::default()
        },
    )?;
    Ok(MosaicProducts {
        merge,
        stats,
        coverage,
        thumbnail,
    })
}

/// WGS84 footprint of a mosaic file.
fn mosaic_coverage(path: &std::path::Path, fallback_epsg: u32) -> Result<Polygon<f64>> {
    let header = probe_geotiff(path)?;
    let epsg = header.crs.as_ref().and_then(CRS::epsg).unwrap_or(fallback_epsg);
    let projection = Projection::from_epsg(epsg)?;
    Ok(coverage_polygon(&header.transform, header.cols, header.rows, |x, y| {
        projection.to_wgs84(x, y)
    }))
}

fn record_metadata(
    cfg: &SyncConfig,
    fetched: &FetchSummary,
    merge: &MergeReport,
    stats: &IndexStatistics,
) -> serde_json::Value {
    let merge_path = match merge.path {
        MergePath::Virtual => "virtual",
        MergePath::Fallback => "fallback",
    };
    json!({
        "source": cfg.stac.collection,
        "window_start": fetched.request.start.to_rfc3339(),
        "window_end": fetched.request.end.to_rfc3339(),
        "cloud_threshold": cfg.cloud_threshold,
        "scenes": fetched.scene_count,
        "tiles": fetched.tiles.len(),
        "crs": format!("EPSG:{}", cfg.target_epsg),
        "merge": merge_path,
        "valid_pixels": stats.valid_count,
    })
}
