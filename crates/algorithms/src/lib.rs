//! # ndvisync algorithms
//!
//! Pure raster algorithms behind the sync pipeline.
//!
//! - **fishnet**: partition a region into a regular grid of request cells
//! - **imagery**: normalized difference index, clear-sky masking, median compositing
//! - **mosaic**: stitch tile files into one raster (virtual mosaic with a pixel-copy fallback)
//! - **statistics**: bounded-window statistics and coverage footprints

pub mod fishnet;
pub mod imagery;
pub mod mosaic;
pub mod statistics;

mod maybe_rayon;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::fishnet::{fishnet, FishnetCell, FishnetParams};
    pub use crate::imagery::{
        apply_mask, clear_sky_mask, median_composite, ndvi, normalized_difference,
        CloudMaskParams,
    };
    pub use crate::mosaic::{
        list_tiles, merge_fallback, merge_tiles, MergePath, MergeReport, MosaicError, VirtualMosaic,
    };
    pub use crate::statistics::{coverage_polygon, window_statistics, IndexStatistics};
    pub use ndvisync_core::prelude::*;
}
