//! Error types for raster handling

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for raster operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid raster dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("Index out of bounds: ({row}, {col}) in raster of size ({rows}, {cols})")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Raster size mismatch: expected ({er}, {ec}), got ({ar}, {ac})")]
    SizeMismatch { er: usize, ec: usize, ar: usize, ac: usize },

    #[error("CRS mismatch: {0} vs {1}")]
    CrsMismatch(String, String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("Window ({col_off}, {row_off}) {cols}x{rows} outside raster of size ({raster_rows}, {raster_cols})")]
    WindowOutOfBounds {
        col_off: usize,
        row_off: usize,
        cols: usize,
        rows: usize,
        raster_rows: usize,
        raster_cols: usize,
    },

    #[error("TIFF error in {path}: {message}")]
    Tiff { path: PathBuf, message: String },

    #[error("GDAL error: {0}")]
    #[cfg(feature = "gdal")]
    Gdal(String),

    #[error("Invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn tiff(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Error::Tiff {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "gdal")]
impl From<gdal::errors::GdalError> for Error {
    fn from(e: gdal::errors::GdalError) -> Self {
        Error::Gdal(e.to_string())
    }
}

/// Result type alias for raster operations
pub type Result<T> = std::result::Result<T, Error>;
