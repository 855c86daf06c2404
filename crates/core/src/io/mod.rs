//! GeoTIFF reading and writing
//!
//! The native backend (always compiled) is built on the `tiff` crate. The
//! `gdal` feature swaps the path-based entry points for GDAL-backed ones;
//! buffer-based I/O stays native.

#[cfg(feature = "gdal")]
mod gdal_io;
mod native;

use crate::crs::CRS;
use crate::raster::GeoTransform;

#[cfg(feature = "gdal")]
pub use gdal_io::{probe_geotiff, read_geotiff, read_geotiff_window, write_geotiff};

#[cfg(not(feature = "gdal"))]
pub use native::{probe_geotiff, read_geotiff, read_geotiff_window, write_geotiff};

pub use native::{read_geotiff_from_buffer, write_geotiff_to_buffer};

/// Options for writing GeoTIFF files
#[derive(Debug, Clone)]
pub struct GeoTiffOptions {
    /// Compression type: "LZW", "DEFLATE" or "NONE"
    pub compression: String,
    /// DEFLATE effort, 1 (fast) to 9 (best)
    pub level: u32,
    /// Block size in pixels. GDAL writes square tiles; the native writer
    /// uses it as the number of rows per strip.
    pub tile_size: usize,
}

impl GeoTiffOptions {
    /// LZW, the layout used for mosaics
    pub fn lzw() -> Self {
        Self {
            compression: "LZW".to_string(),
            ..Self::default()
        }
    }

    /// DEFLATE at the given level
    pub fn deflate(level: u32) -> Self {
        Self {
            compression: "DEFLATE".to_string(),
            level,
            ..Self::default()
        }
    }
}

impl Default for GeoTiffOptions {
    fn default() -> Self {
        Self {
            compression: "NONE".to_string(),
            level: 6,
            tile_size: 256,
        }
    }
}

/// Georeferencing and layout of a GeoTIFF, read without decoding pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterHeader {
    pub rows: usize,
    pub cols: usize,
    pub band_count: usize,
    pub transform: GeoTransform,
    pub crs: Option<CRS>,
    pub nodata: Option<f64>,
}

impl RasterHeader {
    /// Map bounds (min_x, min_y, max_x, max_y)
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.transform.bounds(self.cols, self.rows)
    }
}
