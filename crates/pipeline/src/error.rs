//! Error taxonomy of a sync run

use ndvisync_algorithms::mosaic::MosaicError;
use ndvisync_cloud::CloudError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no imagery between {start} and {end}")]
    NoData { start: String, end: String },

    #[error("tile {tile} failed: {reason}")]
    TileDownload { tile: String, reason: String },

    #[error("merge failed: {0}")]
    Merge(#[from] MosaicError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("remote imagery error: {0}")]
    Cloud(CloudError),

    #[error("raster error: {0}")]
    Core(#[from] ndvisync_core::Error),

    #[error("thumbnail error: {0}")]
    Thumbnail(#[from] ndvisync_colormap::ColormapError),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What the coordinator does with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Abort,
}

impl SyncError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Configuration(_) => Disposition::Abort,
            _ => Disposition::Retry,
        }
    }
}

impl From<CloudError> for SyncError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::NoScenes { start, end } => Self::NoData { start, end },
            CloudError::Configuration(msg) | CloudError::Auth(msg) => Self::Configuration(msg),
            other => Self::Cloud(other),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<zip::result::ZipError> for SyncError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Persistence(format!("bundle: {}", e))
    }
}
