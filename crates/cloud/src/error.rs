//! Error types for the cloud crate.

use thiserror::Error;

/// Errors produced by the STAC client, the COG reader and the composite
/// fetcher.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server does not support Range requests for {url}")]
    RangeNotSupported { url: String },

    #[error("invalid TIFF: {reason}")]
    InvalidTiff { reason: String },

    #[error("unsupported compression: {0}")]
    UnsupportedCompression(u16),

    #[error("unsupported predictor: {0}")]
    UnsupportedPredictor(u16),

    #[error("unsupported data type: bits_per_sample={bps}, sample_format={sf}")]
    UnsupportedDataType { bps: u16, sf: u16 },

    #[error("unsupported raster layout: {0}")]
    UnsupportedLayout(String),

    #[error("unsupported CRS: {0}")]
    UnsupportedCrs(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("no IFD entries found in TIFF")]
    NoIfd,

    #[error("bbox does not intersect raster extent")]
    BBoxOutside,

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("no scenes between {start} and {end}")]
    NoScenes { start: String, end: String },

    #[error("item {item} has no asset '{key}'")]
    MissingAsset { item: String, key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] ndvisync_core::Error),
}

impl CloudError {
    /// Transient failures worth retrying at the request level
    pub fn is_transient(&self) -> bool {
        match self {
            CloudError::Http(e) => e.is_timeout() || e.is_connect(),
            CloudError::Network(_) => true,
            _ => false,
        }
    }
}

/// Result alias for cloud operations.
pub type Result<T> = std::result::Result<T, CloudError>;
