//! Reading scene assets over a region.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use ndvisync_core::Raster;
use tracing::debug;

use crate::auth::CloudAuth;
use crate::bbox::BBox;
use crate::cog::{CogReader, CogReaderOptions};
use crate::error::{CloudError, Result};
use crate::http::{HttpClient, HttpRangeSource};
use crate::reproject::{reproject_bbox, Projection};

/// Reads the part of a single-band asset that covers a WGS84 region.
pub trait AssetReader: Send + Sync {
    /// Pixels of `href` covering `region`, in the asset's own CRS and grid.
    fn read_region(&self, href: &str, region: &BBox)
        -> impl Future<Output = Result<Raster<f64>>> + Send;
}

/// Reads COG assets through HTTP Range requests.
pub struct CogAssetReader {
    client: Arc<HttpClient>,
    auth: Arc<dyn CloudAuth>,
    options: CogReaderOptions,
}

impl CogAssetReader {
    pub fn new(client: Arc<HttpClient>, auth: Arc<dyn CloudAuth>, options: CogReaderOptions) -> Self {
        Self {
            client,
            auth,
            options,
        }
    }
}

impl AssetReader for CogAssetReader {
    async fn read_region(&self, href: &str, region: &BBox) -> Result<Raster<f64>> {
        let source = HttpRangeSource::new(self.client.clone(), href, self.auth.clone());
        let mut reader = CogReader::open(source, self.options.clone()).await?;

        let meta = reader.metadata();
        let crs = meta
            .crs
            .clone()
            .ok_or_else(|| CloudError::UnsupportedCrs(format!("{} has no EPSG code", href)))?;
        let projection = Projection::from_crs(&crs)?;

        // One pixel of margin keeps nearest-neighbour lookups at the edge inside
        let native = reproject_bbox(region, &Projection::Geographic, &projection)
            .expand(meta.geo_transform.pixel_width.abs());
        debug!(href, ?native, "reading asset window");
        reader.read_bbox(&native).await
    }
}

/// Assets held in memory, keyed by href.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssetReader {
    assets: HashMap<String, Raster<f64>>,
}

impl MemoryAssetReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, href: impl Into<String>, raster: Raster<f64>) {
        self.assets.insert(href.into(), raster);
    }
}

impl AssetReader for MemoryAssetReader {
    async fn read_region(&self, href: &str, _region: &BBox) -> Result<Raster<f64>> {
        self.assets
            .get(href)
            .cloned()
            .ok_or_else(|| CloudError::Network(format!("asset not found: {}", href)))
    }
}
