//! Remote composite fetching
//!
//! A [`CompositeSource`] turns a region and a time window into a lazy
//! [`CompositeHandle`]: a cloud-masked, per-pixel median vegetation index
//! that can be exported cell by cell as single-band GeoTIFFs.

mod asset;
mod stac;

pub use asset::{AssetReader, CogAssetReader, MemoryAssetReader};
pub use stac::{join_scenes, SceneAssets, StacComposite, StacCompositeOptions, StacCompositeSource};

use std::future::Future;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use crate::bbox::BBox;
use crate::error::Result;

/// Band name reported by every composite handle
pub const INDEX_BAND: &str = "NDVI";

/// What to composite
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRequest {
    /// Region bounding box in WGS84
    pub region: BBox,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Scene-level cloud cover ceiling, percent
    pub cloud_threshold: f64,
}

impl CompositeRequest {
    /// The `days` long window ending at `now`.
    pub fn trailing(region: BBox, now: DateTime<Utc>, days: i64, cloud_threshold: f64) -> Self {
        Self {
            region,
            start: now - Duration::days(days),
            end: now,
            cloud_threshold,
        }
    }
}

/// Grid an exported cell is written on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportTarget {
    pub epsg: u32,
    /// Pixel size in target CRS units
    pub resolution: f64,
}

/// Query side of the imagery provider.
pub trait CompositeSource: Send + Sync {
    type Handle: CompositeHandle;

    /// Find the scenes for `request`.
    ///
    /// Fails with [`CloudError::NoScenes`](crate::CloudError::NoScenes)
    /// when nothing matches.
    fn query_composite(
        &self,
        request: &CompositeRequest,
    ) -> impl Future<Output = Result<Self::Handle>> + Send;
}

/// A composite ready to be exported.
pub trait CompositeHandle: Send + Sync {
    fn band_names(&self) -> Vec<String>;

    /// Number of scenes reduced into the composite
    fn scene_count(&self) -> usize;

    /// Write the composite over `cell` (WGS84) to `dest` as a Float32
    /// GeoTIFF on the `target` grid.
    fn export_clip(
        &self,
        cell: &BBox,
        target: &ExportTarget,
        dest: &Path,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_trailing_window() {
        let now = Utc.with_ymd_and_hms(2024, 6, 12, 0, 0, 0).unwrap();
        let region = BBox::new(110.9, 31.6, 116.6, 35.0);
        let request = CompositeRequest::trailing(region, now, 7, 20.0);

        assert_eq!(request.start, Utc.with_ymd_and_hms(2024, 6, 5, 0, 0, 0).unwrap());
        assert_eq!(request.end, now);
        assert_eq!(request.region, region);
    }
}
