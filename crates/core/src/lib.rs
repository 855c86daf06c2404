//! # ndvisync core
//!
//! Raster types and GeoTIFF I/O shared by every stage of the ndvisync
//! pipeline.
//!
//! This crate provides:
//! - `Raster<T>`: georeferenced 2D grid backed by `ndarray`
//! - `GeoTransform`: affine pixel <-> map transform
//! - `CRS`: coordinate reference system identifier
//! - GeoTIFF reading/writing, header probing and bounded window reads

pub mod crs;
pub mod error;
pub mod io;
pub mod raster;

pub use crs::CRS;
pub use error::{Error, Result};
pub use raster::{GeoTransform, Raster, RasterElement, RasterStatistics};

/// Nodata sentinel written into every index raster produced by the pipeline.
pub const INDEX_NODATA: f32 = -9999.0;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::crs::CRS;
    pub use crate::error::{Error, Result};
    pub use crate::io::{GeoTiffOptions, RasterHeader};
    pub use crate::raster::{GeoTransform, Raster, RasterElement};
    pub use crate::INDEX_NODATA;
}
