//! STAC-backed composite source.
//!
//! Scenes come from a primary surface-reflectance collection filtered by
//! scene cloud cover, joined by item id with an auxiliary per-pixel cloud
//! probability collection. Pixels are read lazily per exported cell.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::try_join_all;
use geo_types::Rect;
use ndvisync_algorithms::imagery::{
    apply_mask, clear_sky_mask, clip_to_region, median_composite, ndvi, to_index_raster,
    CloudMaskParams,
};
use ndvisync_core::io::{write_geotiff, GeoTiffOptions};
use ndvisync_core::{GeoTransform, Raster, CRS};
use tracing::{debug, info, warn};

use super::asset::AssetReader;
use super::{CompositeHandle, CompositeRequest, CompositeSource, ExportTarget, INDEX_BAND};
use crate::bbox::BBox;
use crate::error::{CloudError, Result};
use crate::reproject::{reproject_bbox, resample_nearest, Projection};
use crate::stac_client::ItemSearch;
use crate::stac_models::{StacItem, StacSearchParams};

/// Collections and asset keys used by [`StacCompositeSource`]
#[derive(Debug, Clone)]
pub struct StacCompositeOptions {
    pub primary_collection: String,
    pub auxiliary_collection: String,
    pub red_asset: String,
    pub nir_asset: String,
    /// Bit-flag quality band on the primary item
    pub quality_asset: String,
    /// Cloud probability (percent) band on the auxiliary item
    pub probability_asset: String,
    pub mask: CloudMaskParams,
    /// Items per search page
    pub page_limit: u32,
}

impl Default for StacCompositeOptions {
    fn default() -> Self {
        Self {
            primary_collection: "sentinel-2-l2a".to_string(),
            auxiliary_collection: "sentinel-2-cloud-probability".to_string(),
            red_asset: "B04".to_string(),
            nir_asset: "B08".to_string(),
            quality_asset: "QA60".to_string(),
            probability_asset: "probability".to_string(),
            mask: CloudMaskParams::default(),
            page_limit: 100,
        }
    }
}

/// Readable hrefs of the four bands of one joined scene
#[derive(Debug, Clone, PartialEq)]
pub struct SceneAssets {
    pub id: String,
    /// WGS84 footprint, when the catalog reports one
    pub footprint: Option<BBox>,
    pub red: String,
    pub nir: String,
    pub quality: String,
    pub probability: String,
}

/// Inner join of two item lists on the item id, in `primary` order.
///
/// Items without a partner are dropped.
pub fn join_scenes(primary: Vec<StacItem>, auxiliary: Vec<StacItem>) -> Vec<(StacItem, StacItem)> {
    let mut by_id: HashMap<String, StacItem> = auxiliary
        .into_iter()
        .map(|item| (item.id.clone(), item))
        .collect();

    primary
        .into_iter()
        .filter_map(|item| {
            let aux = by_id.remove(&item.id)?;
            Some((item, aux))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// [`CompositeSource`] over a STAC catalog.
pub struct StacCompositeSource<S, R> {
    search: Arc<S>,
    reader: Arc<R>,
    options: StacCompositeOptions,
}

impl<S: ItemSearch, R: AssetReader> StacCompositeSource<S, R> {
    pub fn new(search: Arc<S>, reader: Arc<R>, options: StacCompositeOptions) -> Self {
        Self {
            search,
            reader,
            options,
        }
    }

    async fn scene_assets(&self, item: &StacItem, aux: &StacItem) -> Result<SceneAssets> {
        let o = &self.options;
        let search = &self.search;
        let (red, nir, quality, probability) = futures::try_join!(
            search.sign_href(item.asset_href(&o.red_asset)?),
            search.sign_href(item.asset_href(&o.nir_asset)?),
            search.sign_href(item.asset_href(&o.quality_asset)?),
            search.sign_href(aux.asset_href(&o.probability_asset)?),
        )?;

        Ok(SceneAssets {
            id: item.id.clone(),
            footprint: item.footprint(),
            red,
            nir,
            quality,
            probability,
        })
    }
}

impl<S: ItemSearch, R: AssetReader> CompositeSource for StacCompositeSource<S, R> {
    type Handle = StacComposite<R>;

    async fn query_composite(&self, request: &CompositeRequest) -> Result<StacComposite<R>> {
        let base = StacSearchParams::new()
            .bbox(&request.region)
            .datetime_range(request.start, request.end)
            .limit(self.options.page_limit);
        let primary_params = base
            .clone()
            .collection(&self.options.primary_collection)
            .cloud_cover_below(request.cloud_threshold);
        let auxiliary_params = base.collection(&self.options.auxiliary_collection);

        let (primary, auxiliary) = futures::try_join!(
            self.search.search_all(&primary_params),
            self.search.search_all(&auxiliary_params),
        )?;
        let (found, aux_found) = (primary.len(), auxiliary.len());
        let pairs = join_scenes(primary, auxiliary);

        if pairs.is_empty() {
            return Err(CloudError::NoScenes {
                start: request.start.to_rfc3339(),
                end: request.end.to_rfc3339(),
            });
        }

        let mut scenes = Vec::with_capacity(pairs.len());
        for (item, aux) in &pairs {
            scenes.push(self.scene_assets(item, aux).await?);
        }

        info!(
            scenes = scenes.len(),
            primary = found,
            auxiliary = aux_found,
            cloud_threshold = request.cloud_threshold,
            "composite query matched"
        );

        Ok(StacComposite {
            scenes,
            reader: self.reader.clone(),
            region: request.region,
            mask: self.options.mask.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Lazy median NDVI composite over a set of joined scenes.
pub struct StacComposite<R> {
    scenes: Vec<SceneAssets>,
    reader: Arc<R>,
    region: BBox,
    mask: CloudMaskParams,
}

impl<R: AssetReader> StacComposite<R> {
    pub fn scenes(&self) -> &[SceneAssets] {
        &self.scenes
    }

    /// Read one band and bring it onto the target grid.
    async fn read_band(&self, href: &str, read_box: &BBox, grid: &TargetGrid) -> Result<Raster<f64>> {
        let src = self.reader.read_region(href, read_box).await?;
        let src_proj = match src.crs() {
            Some(crs) => Projection::from_crs(crs)?,
            None => return Err(CloudError::UnsupportedCrs(format!("{} has no CRS", href))),
        };
        Ok(resample_nearest(
            &src,
            &src_proj,
            &grid.transform,
            &grid.projection,
            grid.rows,
            grid.cols,
        ))
    }

    /// Masked NDVI of one scene on the target grid.
    async fn scene_index(&self, scene: &SceneAssets, read_box: &BBox, grid: &TargetGrid) -> Result<Raster<f64>> {
        let (mut red, mut nir, quality, probability) = futures::try_join!(
            self.read_band(&scene.red, read_box, grid),
            self.read_band(&scene.nir, read_box, grid),
            self.read_band(&scene.quality, read_box, grid),
            self.read_band(&scene.probability, read_box, grid),
        )?;

        let mask = clear_sky_mask(&quality, &probability, &self.mask)?;
        apply_mask(&mut red, &mask)?;
        apply_mask(&mut nir, &mask)?;

        let clear = mask.iter().filter(|&&keep| keep).count();
        debug!(scene = %scene.id, clear, total = mask.len(), "scene masked");
        Ok(ndvi(&nir, &red)?)
    }
}

struct TargetGrid {
    transform: GeoTransform,
    projection: Projection,
    rows: usize,
    cols: usize,
}

impl TargetGrid {
    /// Grid covering `cell` (WGS84), snapped to multiples of the resolution
    /// so that neighbouring cells share pixel edges.
    fn for_cell(cell: &BBox, target: &ExportTarget) -> Result<Self> {
        let projection = Projection::from_epsg(target.epsg)?;
        let res = target.resolution;
        if !(res.is_finite() && res > 0.0) {
            return Err(CloudError::Configuration(format!("invalid resolution {}", res)));
        }

        let extent = reproject_bbox(cell, &Projection::Geographic, &projection);
        let snapped = BBox::new(
            (extent.min_x / res).floor() * res,
            (extent.min_y / res).floor() * res,
            (extent.max_x / res).ceil() * res,
            (extent.max_y / res).ceil() * res,
        );
        let (transform, cols, rows) = GeoTransform::for_extent(snapped.to_tuple(), res);
        Ok(Self {
            transform,
            projection,
            rows,
            cols,
        })
    }

    /// Grid extent as a WGS84 envelope
    fn geographic_bounds(&self) -> BBox {
        let (min_x, min_y, max_x, max_y) = self.transform.bounds(self.cols, self.rows);
        reproject_bbox(
            &BBox::new(min_x, min_y, max_x, max_y),
            &self.projection,
            &Projection::Geographic,
        )
    }
}

impl<R: AssetReader> CompositeHandle for StacComposite<R> {
    fn band_names(&self) -> Vec<String> {
        vec![INDEX_BAND.to_string()]
    }

    fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    async fn export_clip(&self, cell: &BBox, target: &ExportTarget, dest: &Path) -> Result<()> {
        let grid = TargetGrid::for_cell(cell, target)?;
        let read_box = grid.geographic_bounds();

        let intersecting: Vec<&SceneAssets> = self
            .scenes
            .iter()
            .filter(|s| s.footprint.map_or(true, |f| f.intersects(&read_box)))
            .collect();

        let indexed = try_join_all(
            intersecting
                .iter()
                .map(|scene| self.scene_index(scene, &read_box, &grid)),
        )
        .await?;

        let mut composite = if indexed.is_empty() {
            warn!(?cell, "no scene covers cell, writing empty tile");
            let mut empty = Raster::filled(grid.rows, grid.cols, f64::NAN);
            empty.set_transform(grid.transform);
            empty
        } else {
            median_composite(&indexed)?
        };
        composite.set_crs(Some(CRS::from_epsg(grid.projection.epsg())));

        let region = Rect::from(self.region).to_polygon();
        let projection = grid.projection;
        clip_to_region(&mut composite, &region, |x, y| projection.to_wgs84(x, y));

        write_geotiff(&to_index_raster(&composite), dest, Some(GeoTiffOptions::lzw()))?;
        debug!(
            dest = %dest.display(),
            rows = grid.rows,
            cols = grid.cols,
            scenes = indexed.len(),
            "exported cell"
        );
        Ok(())
    }
}
