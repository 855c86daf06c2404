//! Summary statistics for index mosaics
//!
//! - **window**: min/max/mean over a bounded window, with non-finite results dropped
//! - **coverage**: footprint polygon derived from the geotransform

mod coverage;
mod window;

pub use coverage::coverage_polygon;
pub use window::{window_statistics, IndexStatistics, DEFAULT_WINDOW_CAP};
