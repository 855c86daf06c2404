//! Coverage footprint

use geo_types::{coord, LineString, Polygon};
use ndvisync_core::GeoTransform;

/// Footprint of a `cols x rows` grid as a closed polygon.
///
/// Corners are mapped through `to_geographic` (map CRS to the record's
/// geographic CRS) and every coordinate is clamped to be non-negative.
pub fn coverage_polygon<F>(transform: &GeoTransform, cols: usize, rows: usize, to_geographic: F) -> Polygon<f64>
where
    F: Fn(f64, f64) -> (f64, f64),
{
    let corners = [(0, 0), (cols, 0), (cols, rows), (0, rows), (0, 0)];
    let ring: Vec<_> = corners
        .iter()
        .map(|&(col, row)| {
            let (x, y) = transform.pixel_to_geo_corner(col, row);
            let (lon, lat) = to_geographic(x, y);
            coord! { x: lon.max(0.0), y: lat.max(0.0) }
        })
        .collect();
    Polygon::new(LineString::from(ring), vec![])
}
