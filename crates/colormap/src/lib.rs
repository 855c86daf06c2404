//! # ndvisync colormap
//!
//! Color schemes, raster-to-RGBA rendering and PNG thumbnails for index
//! rasters.

pub mod error;
pub mod render;
pub mod scheme;
pub mod thumbnail;

pub use error::{ColormapError, Result};
pub use render::{auto_params, observed_range, raster_to_rgba, ColormapParams};
pub use scheme::{evaluate, gray_level, ColorScheme, ColorStop, Rgb};
pub use thumbnail::{render_thumbnail, thumbnail_size, ThumbnailOptions};
