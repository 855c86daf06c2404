//! Temporal compositing
//!
//! Reduces a stack of co-registered, already masked index scenes to one
//! representative raster.

use crate::maybe_rayon::*;
use geo::Intersects;
use geo_types::{Point, Polygon};
use ndvisync_core::raster::Raster;
use ndvisync_core::{Error, Result};

use super::indices::{build_output, check_dimensions};

/// Per-pixel median across `scenes`, ignoring NaN.
///
/// With an even number of valid observations the two middle values are
/// averaged. Pixels with no valid observation stay NaN.
pub fn median_composite(scenes: &[Raster<f64>]) -> Result<Raster<f64>> {
    let first = scenes.first().ok_or_else(|| Error::InvalidParameter {
        name: "scenes",
        value: "0".to_string(),
        reason: "median of an empty collection".to_string(),
    })?;
    for scene in &scenes[1..] {
        check_dimensions(first, scene)?;
    }

    let (rows, cols) = first.shape();

    let data: Vec<f64> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut values = Vec::with_capacity(scenes.len());
            let mut row_data = vec![f64::NAN; cols];
            for (col, out) in row_data.iter_mut().enumerate() {
                values.clear();
                values.extend(
                    scenes
                        .iter()
                        .map(|s| s.data()[(row, col)])
                        .filter(|v| v.is_finite()),
                );
                *out = median(&mut values);
            }
            row_data
        })
        .collect();

    build_output(first, rows, cols, data)
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Set pixels whose centre falls outside `region` to NaN.
///
/// `to_region` maps the raster's map coordinates into the region's CRS.
pub fn clip_to_region<F>(raster: &mut Raster<f64>, region: &Polygon<f64>, to_region: F)
where
    F: Fn(f64, f64) -> (f64, f64),
{
    let transform = *raster.transform();
    for ((row, col), value) in raster.data_mut().indexed_iter_mut() {
        let (x, y) = transform.pixel_to_geo(col, row);
        let (rx, ry) = to_region(x, y);
        if !region.intersects(&Point::new(rx, ry)) {
            *value = f64::NAN;
        }
    }
}
