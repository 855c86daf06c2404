//! Sync configuration
//!
//! Every tunable of a run lives in [`SyncConfig`]. Files are JSON; absent
//! fields take their defaults, so a config file only lists what it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ndvisync_algorithms::fishnet::FishnetParams;
use ndvisync_algorithms::imagery::CloudMaskParams;
use ndvisync_cloud::{BBox, StacCatalog, StacCompositeOptions};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;

/// Imagery catalog, collections and asset keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StacSettings {
    /// `earth-search`, `planetary-computer` or a STAC API URL
    pub catalog: String,
    pub collection: String,
    pub probability_collection: String,
    pub red_asset: String,
    pub nir_asset: String,
    pub quality_asset: String,
    pub probability_asset: String,
}

impl Default for StacSettings {
    fn default() -> Self {
        let composite = StacCompositeOptions::default();
        Self {
            catalog: "earth-search".to_string(),
            collection: composite.primary_collection,
            probability_collection: composite.auxiliary_collection,
            red_asset: composite.red_asset,
            nir_asset: composite.nir_asset,
            quality_asset: composite.quality_asset,
            probability_asset: composite.probability_asset,
        }
    }
}

impl StacSettings {
    pub fn catalog(&self) -> StacCatalog {
        StacCatalog::from_str_or_url(&self.catalog)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Short region label used in record names
    pub region_name: String,
    /// Region bounding box `[min_lon, min_lat, max_lon, max_lat]`
    pub bbox: [f64; 4],
    /// Length of the trailing composite window
    pub window_days: i64,
    /// Scene-level cloud cover ceiling, percent
    pub cloud_threshold: f64,
    /// Per-pixel cloud probability ceiling, percent
    pub cloud_probability: f64,
    pub quality_bits: u32,
    pub grid_rows: usize,
    pub grid_cols: usize,
    /// Buffer around the bbox before gridding, degrees
    pub grid_delta: f64,
    /// Only export the first N cells
    pub tile_limit: Option<usize>,
    pub target_epsg: u32,
    /// Metres (or degrees for EPSG:4326) per pixel
    pub resolution: f64,
    pub workers: usize,
    pub tile_retries: u32,
    pub stac: StacSettings,
    /// Service-account key file holding the bearer token
    pub service_account: Option<PathBuf>,
    pub output_root: PathBuf,
    pub database: PathBuf,
    pub lock_dir: PathBuf,
    pub cooldown_secs: u64,
    pub retry: RetryPolicy,
    pub stats_window_cap: usize,
    pub thumbnail_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mask = CloudMaskParams::default();
        let grid = FishnetParams::default();
        Self {
            region_name: "henan".to_string(),
            bbox: [110.9, 31.6, 116.6, 35.0],
            window_days: 7,
            cloud_threshold: 20.0,
            cloud_probability: mask.max_probability,
            quality_bits: mask.quality_bits,
            grid_rows: grid.rows,
            grid_cols: grid.cols,
            grid_delta: grid.delta,
            tile_limit: grid.limit,
            target_epsg: 32650,
            resolution: 10.0,
            workers: 10,
            tile_retries: 3,
            stac: StacSettings::default(),
            service_account: None,
            output_root: PathBuf::from("data/ndvi"),
            database: PathBuf::from("data/ndvisync.db"),
            lock_dir: PathBuf::from("data/locks"),
            cooldown_secs: 7 * 24 * 3600 - 3600,
            retry: RetryPolicy::default(),
            stats_window_cap: 3000,
            thumbnail_size: 256,
        }
    }
}

impl SyncConfig {
    /// Read a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| SyncError::Configuration(format!("invalid config {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SyncError::Configuration(msg));

        if !self.region().is_valid() {
            return invalid(format!("bbox {:?} is empty or inverted", self.bbox));
        }
        if self.region_name.trim().is_empty() {
            return invalid("region_name is empty".to_string());
        }
        if self.grid_rows == 0 || self.grid_cols == 0 {
            return invalid(format!("grid {}x{} has no cells", self.grid_rows, self.grid_cols));
        }
        if !(self.resolution > 0.0 && self.resolution.is_finite()) {
            return invalid(format!("resolution {} must be positive", self.resolution));
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1".to_string());
        }
        if self.window_days <= 0 {
            return invalid(format!("window_days {} must be positive", self.window_days));
        }
        if let Some(path) = &self.service_account {
            if !path.is_file() {
                return invalid(format!("service account file {} not found", path.display()));
            }
        }
        Ok(())
    }

    pub fn region(&self) -> BBox {
        let [min_x, min_y, max_x, max_y] = self.bbox;
        BBox::new(min_x, min_y, max_x, max_y)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn fishnet_params(&self) -> FishnetParams {
        FishnetParams {
            rows: self.grid_rows,
            cols: self.grid_cols,
            delta: self.grid_delta,
            limit: self.tile_limit,
        }
    }

    pub fn composite_options(&self) -> StacCompositeOptions {
        StacCompositeOptions {
            primary_collection: self.stac.collection.clone(),
            auxiliary_collection: self.stac.probability_collection.clone(),
            red_asset: self.stac.red_asset.clone(),
            nir_asset: self.stac.nir_asset.clone(),
            quality_asset: self.stac.quality_asset.clone(),
            probability_asset: self.stac.probability_asset.clone(),
            mask: CloudMaskParams {
                quality_bits: self.quality_bits,
                max_probability: self.cloud_probability,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cooldown(), Duration::from_secs(601_200));
        assert_eq!(config.fishnet_params().rows, 8);
        assert_eq!(config.fishnet_params().cols, 6);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"{{"grid_rows": 2, "grid_cols": 2, "retry": {{"max_retries": 5}}}}"#).unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!((config.grid_rows, config.grid_cols), (2, 2));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_secs, 60);
        assert_eq!(config.target_epsg, 32650);
    }

    #[test]
    fn test_rejects_bad_values() {
        let inverted = SyncConfig {
            bbox: [116.6, 31.6, 110.9, 35.0],
            ..Default::default()
        };
        assert!(matches!(inverted.validate(), Err(SyncError::Configuration(_))));

        let no_grid = SyncConfig {
            grid_cols: 0,
            ..Default::default()
        };
        assert!(no_grid.validate().is_err());

        let no_workers = SyncConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(no_workers.validate().is_err());

        let flat = SyncConfig {
            resolution: 0.0,
            ..Default::default()
        };
        assert!(flat.validate().is_err());
    }

    #[test]
    fn test_missing_service_account_is_configuration_error() {
        let config = SyncConfig {
            service_account: Some(PathBuf::from("/nonexistent/key.json")),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("service account"));
    }

    #[test]
    fn test_composite_options_follow_config() {
        let config = SyncConfig {
            cloud_probability: 30.0,
            ..Default::default()
        };
        let options = config.composite_options();
        assert_eq!(options.mask.max_probability, 30.0);
        assert_eq!(options.red_asset, "B04");
    }
}
