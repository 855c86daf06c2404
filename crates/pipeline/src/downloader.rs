//! Tile download and validation
//!
//! Each fishnet cell is exported to its own file. Downloads run
//! concurrently up to `workers`, each retried on its own; the set is only
//! handed to the merger once every file passes [`validate_tiles`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use ndvisync_algorithms::fishnet::FishnetCell;
use ndvisync_algorithms::mosaic::list_tiles;
use ndvisync_algorithms::statistics::window_statistics;
use ndvisync_cloud::{BBox, CompositeHandle, ExportTarget};
use ndvisync_core::io::{probe_geotiff, read_geotiff_window};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Pixels read per side by the validation probe
const PROBE_WINDOW: usize = 16;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Concurrent exports
    pub workers: usize,
    /// Retries per tile after the first attempt
    pub retries: u32,
    /// First per-tile backoff, doubled on each retry
    pub retry_delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// One cell's output file
#[derive(Debug, Clone)]
pub struct TileArtifact {
    pub cell: FishnetCell,
    pub path: PathBuf,
    /// Set by [`validate_tiles`]
    pub valid: bool,
}

impl TileArtifact {
    pub fn name(&self) -> String {
        self.cell.file_stem()
    }
}

async fn download_one<H: CompositeHandle>(
    handle: &H,
    cell: &FishnetCell,
    target: &ExportTarget,
    dir: &Path,
    options: &DownloadOptions,
) -> Result<TileArtifact> {
    let name = cell.file_stem();
    let path = dir.join(format!("{}.tif", name));
    let region = BBox::from(cell.bounds);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match handle.export_clip(&region, target, &path).await {
            Ok(()) => {
                debug!(tile = %name, attempt, "tile exported");
                return Ok(TileArtifact {
                    cell: cell.clone(),
                    path,
                    valid: false,
                });
            }
            Err(e) => {
                if path.exists() {
                    if let Err(rm) = std::fs::remove_file(&path) {
                        warn!(tile = %name, error = %rm, "failed to remove partial tile");
                    }
                }
                if attempt > options.retries {
                    return Err(SyncError::TileDownload {
                        tile: name,
                        reason: e.to_string(),
                    });
                }
                let delay = options.retry_delay * 2u32.saturating_pow(attempt - 1);
                warn!(tile = %name, attempt, delay_secs = delay.as_secs_f64(), error = %e, "tile export failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Export every cell of `cells` into `dir` as `<file_stem>.tif`.
///
/// All cells are attempted even when some fail; the first failure (in
/// cell order) is returned afterwards.
pub async fn download_tiles<H: CompositeHandle>(
    handle: &H,
    cells: &[FishnetCell],
    target: &ExportTarget,
    dir: &Path,
    options: &DownloadOptions,
) -> Result<Vec<TileArtifact>> {
    std::fs::create_dir_all(dir)?;
    info!(tiles = cells.len(), workers = options.workers, dir = %dir.display(), "downloading tiles");

    let mut results: Vec<(usize, Result<TileArtifact>)> = stream::iter(cells)
        .map(|cell| async move { (cell.index, download_one(handle, cell, target, dir, options).await) })
        .buffer_unordered(options.workers.max(1))
        .collect()
        .await;
    results.sort_by_key(|(index, _)| *index);

    let mut artifacts = Vec::with_capacity(results.len());
    let mut first_error = None;
    for (_, result) in results {
        match result {
            Ok(artifact) => artifacts.push(artifact),
            Err(e) => {
                warn!(error = %e, "tile download failed");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    info!(tiles = artifacts.len(), "tiles downloaded");
    Ok(artifacts)
}

fn validate_tile(path: &Path) -> std::result::Result<(), String> {
    let header = probe_geotiff(path).map_err(|e| format!("unreadable: {}", e))?;
    if header.band_count == 0 || header.rows == 0 || header.cols == 0 {
        return Err(format!(
            "empty raster ({} bands, {}x{})",
            header.band_count, header.cols, header.rows
        ));
    }
    let stats = window_statistics(path, usize::MAX).map_err(|e| format!("statistics failed: {}", e))?;
    if stats.valid_count == 0 || stats.is_empty() {
        return Err("no valid pixels".to_string());
    }
    let _probe: ndvisync_core::Raster<f32> = read_geotiff_window(
        path,
        0,
        0,
        header.cols.min(PROBE_WINDOW),
        header.rows.min(PROBE_WINDOW),
    )
    .map_err(|e| format!("window read failed: {}", e))?;
    Ok(())
}

/// Check the produced tile set and flag each artifact valid.
///
/// Fails when `dir` does not hold exactly `expected` tiles or when any
/// tile cannot be opened, summarized or window-read, or holds only nodata.
pub fn validate_tiles(artifacts: &mut [TileArtifact], dir: &Path, expected: usize) -> Result<()> {
    let found = list_tiles(dir)?.len();
    if found != expected || artifacts.len() != expected {
        return Err(SyncError::TileDownload {
            tile: dir.display().to_string(),
            reason: format!("expected {} tiles, found {}", expected, found),
        });
    }

    for artifact in artifacts.iter_mut() {
        validate_tile(&artifact.path).map_err(|reason| SyncError::TileDownload {
            tile: artifact.name(),
            reason,
        })?;
        artifact.valid = true;
    }
    debug!(tiles = expected, "tile set validated");
    Ok(())
}

/// Remove every `*.tif` left in `dir` by an earlier attempt.
pub fn clean_partial_tiles(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let tiles = list_tiles(dir)?;
    for path in &tiles {
        std::fs::remove_file(path)?;
    }
    if !tiles.is_empty() {
        info!(removed = tiles.len(), dir = %dir.display(), "removed partial tiles");
    }
    Ok(tiles.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndvisync_algorithms::fishnet::{fishnet_rect, FishnetParams};
    use ndvisync_cloud::composite::INDEX_BAND;
    use ndvisync_cloud::CloudError;
    use ndvisync_core::io::write_geotiff;
    use ndvisync_core::{GeoTransform, Raster, CRS, INDEX_NODATA};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Writes a constant tile per cell; fails the first `failures[stem]`
    /// exports of a cell.
    struct FakeHandle {
        failures: Mutex<HashMap<String, u32>>,
    }

    impl FakeHandle {
        fn new(failures: &[(&str, u32)]) -> Self {
            Self {
                failures: Mutex::new(failures.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
            }
        }
    }

    impl CompositeHandle for FakeHandle {
        fn band_names(&self) -> Vec<String> {
            vec![INDEX_BAND.to_string()]
        }

        fn scene_count(&self) -> usize {
            1
        }

        async fn export_clip(&self, cell: &BBox, target: &ExportTarget, dest: &Path) -> ndvisync_cloud::Result<()> {
            let stem = dest.file_stem().unwrap().to_string_lossy().to_string();
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(left) = failures.get_mut(&stem) {
                    if *left > 0 {
                        *left -= 1;
                        std::fs::write(dest, b"partial").unwrap();
                        return Err(CloudError::Network("connection reset".into()));
                    }
                }
            }
            let (gt, cols, rows) = GeoTransform::for_extent(cell.to_tuple(), target.resolution);
            let mut raster = Raster::filled(rows, cols, 0.42f32);
            raster.set_transform(gt);
            raster.set_crs(Some(CRS::from_epsg(target.epsg)));
            raster.set_nodata(Some(INDEX_NODATA));
            write_geotiff(&raster, dest, None)?;
            Ok(())
        }
    }

    fn cells() -> Vec<FishnetCell> {
        let rect = geo_types::Rect::new((0.0, 0.0), (2.0, 2.0));
        let params = FishnetParams {
            rows: 2,
            cols: 2,
            ..Default::default()
        };
        fishnet_rect(rect, &CRS::from_epsg(4326), &params).unwrap()
    }

    fn target() -> ExportTarget {
        ExportTarget {
            epsg: 4326,
            resolution: 0.25,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let handle = FakeHandle::new(&[("tile_r01_c00", 2)]);
        let cells = cells();

        let mut tiles = download_tiles(&handle, &cells, &target(), dir.path(), &DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[0].name(), "tile_r00_c00");
        assert!(tiles.iter().all(|t| !t.valid));

        validate_tiles(&mut tiles, dir.path(), 4).unwrap();
        assert!(tiles.iter().all(|t| t.valid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_tile_fails_after_all_attempted() {
        let dir = tempfile::tempdir().unwrap();
        let handle = FakeHandle::new(&[("tile_r00_c01", 10)]);
        let options = DownloadOptions {
            retries: 1,
            ..Default::default()
        };

        let err = download_tiles(&handle, &cells(), &target(), dir.path(), &options)
            .await
            .unwrap_err();
        match err {
            SyncError::TileDownload { tile, .. } => assert_eq!(tile, "tile_r00_c01"),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(list_tiles(dir.path()).unwrap().len(), 3);
        assert!(!dir.path().join("tile_r00_c01.tif").exists());
    }

    #[tokio::test]
    async fn test_validation_rejects_missing_and_corrupt_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let handle = FakeHandle::new(&[]);
        let mut tiles = download_tiles(&handle, &cells(), &target(), dir.path(), &DownloadOptions::default())
            .await
            .unwrap();

        assert!(validate_tiles(&mut tiles, dir.path(), 5).is_err());

        std::fs::write(&tiles[2].path, b"not a tiff").unwrap();
        let err = validate_tiles(&mut tiles, dir.path(), 4).unwrap_err();
        assert!(err.to_string().contains("tile_r01_c00"));
    }

    #[tokio::test]
    async fn test_validation_rejects_all_nodata_tile() {
        let dir = tempfile::tempdir().unwrap();
        let cell = cells().remove(0);
        let path = dir.path().join(format!("{}.tif", cell.file_stem()));

        let (gt, cols, rows) = GeoTransform::for_extent(BBox::from(cell.bounds).to_tuple(), 0.25);
        let mut raster = Raster::filled(rows, cols, INDEX_NODATA);
        raster.set_transform(gt);
        raster.set_crs(Some(CRS::from_epsg(4326)));
        raster.set_nodata(Some(INDEX_NODATA));
        write_geotiff(&raster, &path, None).unwrap();

        let mut tiles = vec![TileArtifact {
            cell,
            path,
            valid: false,
        }];
        match validate_tiles(&mut tiles, dir.path(), 1).unwrap_err() {
            SyncError::TileDownload { tile, reason } => {
                assert_eq!(tile, "tile_r00_c00");
                assert!(reason.contains("no valid pixels"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!tiles[0].valid);
    }

    #[test]
    fn test_clean_partial_tiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tile_r00_c00.tif"), b"x").unwrap();
        std::fs::write(dir.path().join("tile_r00_c01.tif"), b"x").unwrap();
        std::fs::write(dir.path().join("metadata.json"), b"{}").unwrap();

        assert_eq!(clean_partial_tiles(dir.path()).unwrap(), 2);
        assert!(dir.path().join("metadata.json").exists());
        assert_eq!(clean_partial_tiles(&dir.path().join("missing")).unwrap(), 0);
    }
}
