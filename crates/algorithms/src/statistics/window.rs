//! Bounded-window statistics
//!
//! Statistics are read from at most `cap x cap` pixels at the top-left of
//! band 1. On larger mosaics this is a sample, not the full-raster value.

use ndvisync_core::io::{probe_geotiff, read_geotiff_window};
use ndvisync_core::{Raster, RasterElement, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Default side length of the statistics window
pub const DEFAULT_WINDOW_CAP: usize = 3000;

/// Min/max/mean of an index raster.
///
/// Each value is `None` when it is undefined or non-finite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub valid_count: usize,
    /// (rows, cols) actually sampled
    pub window: (usize, usize),
}

impl IndexStatistics {
    /// Statistics over every valid pixel of `raster`.
    pub fn from_raster<T: RasterElement>(raster: &Raster<T>) -> Self {
        let stats = raster.statistics();
        Self {
            min: stats.min.and_then(|v| finite(v.to_f64())),
            max: stats.max.and_then(|v| finite(v.to_f64())),
            mean: finite(stats.mean),
            valid_count: stats.valid_count,
            window: raster.shape(),
        }
    }

    /// Drop non-finite values and clamp the rest into the index range
    /// `[-1, 1]`.
    pub fn sanitized(self) -> Self {
        let clean = |v: Option<f64>| finite(v).map(|v| v.clamp(-1.0, 1.0));
        Self {
            min: clean(self.min),
            max: clean(self.max),
            mean: clean(self.mean),
            ..self
        }
    }

    /// True when no statistic is defined
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.mean.is_none()
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Statistics of band 1 of `path` over the top-left window of at most
/// `cap x cap` pixels.
pub fn window_statistics(path: &Path, cap: usize) -> Result<IndexStatistics> {
    let header = probe_geotiff(path)?;
    let cap = cap.max(1);
    let rows = header.rows.min(cap);
    let cols = header.cols.min(cap);

    let window: Raster<f32> = read_geotiff_window(path, 0, 0, cols, rows)?;
    let stats = IndexStatistics::from_raster(&window);

    debug!(
        path = %path.display(),
        rows,
        cols,
        valid = stats.valid_count,
        "window statistics"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndvisync_core::io::write_geotiff;
    use ndvisync_core::{GeoTransform, INDEX_NODATA};

    fn write(dir: &Path, raster: &Raster<f32>) -> std::path::PathBuf {
        let path = dir.join("stats.tif");
        write_geotiff(raster, &path, None).unwrap();
        path
    }

    #[test]
    fn test_ignores_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let mut raster = Raster::filled(4, 4, 0.42f32);
        raster.set(0, 0, INDEX_NODATA).unwrap();
        raster.set(3, 3, f32::NAN).unwrap();
        raster.set_nodata(Some(INDEX_NODATA));
        raster.set_transform(GeoTransform::new(0.0, 4.0, 1.0, -1.0));

        let stats = window_statistics(&write(dir.path(), &raster), DEFAULT_WINDOW_CAP).unwrap();
        assert_eq!(stats.valid_count, 14);
        assert_relative_eq!(stats.min.unwrap(), 0.42, epsilon = 1e-6);
        assert_relative_eq!(stats.max.unwrap(), 0.42, epsilon = 1e-6);
        assert_relative_eq!(stats.mean.unwrap(), 0.42, epsilon = 1e-6);
    }

    #[test]
    fn test_window_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut raster = Raster::filled(6, 6, 1.0f32);
        for row in 0..6 {
            raster.set(row, 5, -1.0).unwrap();
        }
        let path = write(dir.path(), &raster);

        let stats = window_statistics(&path, 4).unwrap();
        assert_eq!(stats.window, (4, 4));
        assert_eq!(stats.min, Some(1.0));
    }

    #[test]
    fn test_all_nan_window_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let raster = Raster::filled(3, 3, f32::NAN);

        let stats = window_statistics(&write(dir.path(), &raster), 3000).unwrap();
        assert!(stats.is_empty());
        assert_eq!(stats.valid_count, 0);
    }

    #[test]
    fn test_all_infinite_window_is_absent() {
        for value in [f32::INFINITY, f32::NEG_INFINITY] {
            let dir = tempfile::tempdir().unwrap();
            let raster = Raster::filled(3, 3, value);

            let stats = window_statistics(&write(dir.path(), &raster), 3000).unwrap();
            assert!(stats.is_empty(), "{value} should sanitize to absent");
        }
    }

    #[test]
    fn test_sanitized_clamps() {
        let stats = IndexStatistics {
            min: Some(-1.5),
            max: Some(f64::INFINITY),
            mean: Some(0.3),
            valid_count: 3,
            window: (1, 3),
        }
        .sanitized();
        assert_eq!(stats.min, Some(-1.0));
        assert_eq!(stats.max, None);
        assert_eq!(stats.mean, Some(0.3));
    }
}
