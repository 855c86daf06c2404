//! Raster merging
//!
//! Stitches per-cell tile files into one mosaic. The primary path builds a
//! [`VirtualMosaic`] over lazily probed sources and materializes it with
//! nearest-neighbour sampling; when that cannot be constructed,
//! [`merge_fallback`] copies pixel blocks at integer offsets.

mod fallback;
mod virtual_mosaic;

pub use fallback::merge_fallback;
pub use virtual_mosaic::VirtualMosaic;

use ndvisync_core::io::GeoTiffOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while merging tiles
#[derive(Error, Debug)]
pub enum MosaicError {
    #[error("no tiles to merge")]
    Empty,

    #[error("incompatible tile {path}: {reason}")]
    IncompatibleSource { path: PathBuf, reason: String },

    #[error("raster error: {0}")]
    Core(#[from] ndvisync_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MosaicResult<T> = std::result::Result<T, MosaicError>;

/// Which merge strategy produced the mosaic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePath {
    Virtual,
    Fallback,
}

/// Summary of one merge
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub path: MergePath,
    pub rows: usize,
    pub cols: usize,
    pub tiles_used: usize,
    pub tiles_skipped: usize,
}

/// Sorted list of `*.tif` files directly inside `dir`.
pub fn list_tiles(dir: &Path) -> MosaicResult<Vec<PathBuf>> {
    let mut tiles = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_tif = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("tif"));
        if path.is_file() && is_tif {
            tiles.push(path);
        }
    }
    tiles.sort();
    Ok(tiles)
}

/// Merge `tiles` into `output`, preferring the virtual mosaic.
///
/// Any error while building or materializing the virtual mosaic is logged
/// and the pixel-copy fallback is used instead; only a fallback failure is
/// returned.
pub fn merge_tiles<P: AsRef<Path>>(tiles: &[P], output: &Path) -> MosaicResult<MergeReport> {
    if tiles.is_empty() {
        return Err(MosaicError::Empty);
    }

    let options = GeoTiffOptions::lzw();
    let primary = VirtualMosaic::build(tiles).and_then(|mosaic| {
        mosaic.materialize(output, &options)?;
        let (rows, cols) = mosaic.shape();
        Ok(MergeReport {
            path: MergePath::Virtual,
            rows,
            cols,
            tiles_used: mosaic.source_count(),
            tiles_skipped: 0,
        })
    });

    match primary {
        Ok(report) => {
            info!(tiles = report.tiles_used, rows = report.rows, cols = report.cols, "virtual mosaic written");
            Ok(report)
        }
        Err(e) => {
            warn!(error = %e, "virtual mosaic unavailable, falling back to pixel copy");
            let report = merge_fallback(tiles, output, &options)?;
            info!(
                tiles = report.tiles_used,
                skipped = report.tiles_skipped,
                "fallback mosaic written"
            );
            Ok(report)
        }
    }
}
