//! Imagery algorithms
//!
//! - Normalized difference / NDVI on single-band rasters
//! - Clear-sky masking from quality bits and cloud probability
//! - Per-pixel median compositing and region clipping

mod composite;
mod indices;
mod mask;

pub use composite::{clip_to_region, median_composite};
pub use indices::{
    ndvi, normalized_difference, normalized_difference_with, to_index_raster,
    NormalizedDifferenceParams,
};
pub use mask::{apply_mask, clear_sky_mask, CloudMaskParams};
