//! Error types for rendering

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ColormapError>;

#[derive(Error, Debug)]
pub enum ColormapError {
    #[error("cannot render an empty raster")]
    EmptyRaster,

    #[error("pixel buffer does not match {width}x{height}")]
    BufferSize { width: u32, height: u32 },

    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}
