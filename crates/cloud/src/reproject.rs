//! Pure-Rust WGS84 ↔ UTM reprojection (Snyder 1987, USGS formulas) and
//! nearest-neighbour resampling between grids.
//!
//! Covers EPSG 4326 plus 326xx (UTM North) and 327xx (UTM South), which is
//! what Sentinel-2 and Landsat ship in. No libproj.

use ndarray::Array2;
use ndvisync_core::{GeoTransform, Raster, CRS};

use crate::bbox::BBox;
use crate::error::{CloudError, Result};

// ── WGS84 ellipsoid constants ────────────────────────────────────────────

const A: f64 = 6_378_137.0; // semi-major axis (m)
const F: f64 = 1.0 / 298.257_223_563; // flattening
const E2: f64 = 2.0 * F - F * F; // eccentricity squared
const E_PRIME2: f64 = E2 / (1.0 - E2); // second eccentricity squared
const K0: f64 = 0.9996; // UTM scale factor
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// Points sampled along each bbox edge when computing an envelope
const EDGE_SAMPLES: usize = 8;

// ── Projection ───────────────────────────────────────────────────────────

/// A supported coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// EPSG:4326, (lon, lat) degrees
    Geographic,
    /// WGS84 / UTM, (easting, northing) metres
    Utm { zone: u32, north: bool },
}

impl Projection {
    pub fn from_epsg(epsg: u32) -> Result<Self> {
        if epsg == 4326 {
            return Ok(Projection::Geographic);
        }
        parse_utm_epsg(epsg)
            .map(|(zone, north)| Projection::Utm { zone, north })
            .ok_or_else(|| CloudError::UnsupportedCrs(format!("EPSG:{}", epsg)))
    }

    pub fn from_crs(crs: &CRS) -> Result<Self> {
        let epsg = crs
            .epsg()
            .ok_or_else(|| CloudError::UnsupportedCrs(crs.to_string()))?;
        Self::from_epsg(epsg)
    }

    pub fn epsg(&self) -> u32 {
        match *self {
            Projection::Geographic => 4326,
            Projection::Utm { zone, north: true } => 32600 + zone,
            Projection::Utm { zone, north: false } => 32700 + zone,
        }
    }

    /// Map coordinates to (lon, lat)
    pub fn to_wgs84(&self, x: f64, y: f64) -> (f64, f64) {
        match *self {
            Projection::Geographic => (x, y),
            Projection::Utm { zone, north } => utm_to_wgs84(x, y, zone, north),
        }
    }

    /// (lon, lat) to map coordinates
    pub fn from_wgs84(&self, lon: f64, lat: f64) -> (f64, f64) {
        match *self {
            Projection::Geographic => (lon, lat),
            Projection::Utm { zone, north } => wgs84_to_utm(lon, lat, zone, north),
        }
    }

    /// Transform a point from `self` into `target`.
    pub fn transform_to(&self, target: &Projection, x: f64, y: f64) -> (f64, f64) {
        if self == target {
            return (x, y);
        }
        let (lon, lat) = self.to_wgs84(x, y);
        target.from_wgs84(lon, lat)
    }
}

// ── Public API ───────────────────────────────────────────────────────────

/// Envelope of `bbox` (in `from`) after projecting it into `to`.
///
/// Edges are densified, so the curvature of UTM grid lines is covered.
pub fn reproject_bbox(bbox: &BBox, from: &Projection, to: &Projection) -> BBox {
    if from == to {
        return *bbox;
    }

    let mut out = BBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for i in 0..=EDGE_SAMPLES {
        let t = i as f64 / EDGE_SAMPLES as f64;
        let x = bbox.min_x + t * bbox.width();
        let y = bbox.min_y + t * bbox.height();
        for (px, py) in [(x, bbox.min_y), (x, bbox.max_y), (bbox.min_x, y), (bbox.max_x, y)] {
            let (tx, ty) = from.transform_to(to, px, py);
            out.min_x = out.min_x.min(tx);
            out.min_y = out.min_y.min(ty);
            out.max_x = out.max_x.max(tx);
            out.max_y = out.max_y.max(ty);
        }
    }
    out
}

/// Resample `src` onto a `rows x cols` grid at `target` by nearest
/// neighbour. Pixels outside the source, or on source nodata, become NaN.
pub fn resample_nearest(
    src: &Raster<f64>,
    src_proj: &Projection,
    target: &GeoTransform,
    target_proj: &Projection,
    rows: usize,
    cols: usize,
) -> Raster<f64> {
    let (src_rows, src_cols) = src.shape();
    let src_gt = src.transform();

    let data = Array2::from_shape_fn((rows, cols), |(row, col)| {
        let (x, y) = target.pixel_to_geo(col, row);
        let (sx, sy) = target_proj.transform_to(src_proj, x, y);
        let (fc, fr) = src_gt.geo_to_pixel(sx, sy);
        if !(fc >= 0.0 && fr >= 0.0) {
            return f64::NAN;
        }
        let (c, r) = (fc as usize, fr as usize);
        if c >= src_cols || r >= src_rows {
            return f64::NAN;
        }
        let v = src.data()[(r, c)];
        if src.is_nodata(v) {
            f64::NAN
        } else {
            v
        }
    });

    let mut out = Raster::from_array(data);
    out.set_transform(*target);
    out.set_crs(Some(CRS::from_epsg(target_proj.epsg())));
    out
}

/// Parse an EPSG code into UTM zone info: `Some((zone, is_north))`.
///
/// - EPSG 326xx → zone xx, North hemisphere
/// - EPSG 327xx → zone xx, South hemisphere
pub fn parse_utm_epsg(epsg: u32) -> Option<(u32, bool)> {
    if (32601..=32660).contains(&epsg) {
        Some((epsg - 32600, true))
    } else if (32701..=32760).contains(&epsg) {
        Some((epsg - 32700, false))
    } else {
        None
    }
}

// ── Core projection (Snyder 1987, USGS Prof. Paper 1395, pp. 61-64) ─────

fn central_meridian(zone: u32) -> f64 {
    ((zone as f64 - 1.0) * 6.0 - 180.0 + 3.0).to_radians()
}

/// Convert WGS84 (longitude, latitude) in degrees to UTM (easting, northing)
/// in metres for the given zone and hemisphere.
fn wgs84_to_utm(lon_deg: f64, lat_deg: f64, zone: u32, north: bool) -> (f64, f64) {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    let lon0 = central_meridian(zone);

    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let tan_lat = lat.tan();

    let n = A / (1.0 - E2 * sin_lat * sin_lat).sqrt();
    let t = tan_lat * tan_lat;
    let c = E_PRIME2 * cos_lat * cos_lat;
    let a_coeff = cos_lat * (lon - lon0);
    let m = meridional_arc(lat);

    let a2 = a_coeff * a_coeff;
    let a4 = a2 * a2;
    let a6 = a4 * a2;

    // Snyder eq. 8-9
    let easting = K0 * n
        * (a_coeff
            + (1.0 - t + c) * a2 * a_coeff / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * E_PRIME2) * a4 * a_coeff / 120.0)
        + FALSE_EASTING;

    // Snyder eq. 8-10
    let northing = K0
        * (m + n
            * tan_lat
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * E_PRIME2) * a6 / 720.0));

    let northing = if north {
        northing
    } else {
        northing + FALSE_NORTHING_SOUTH
    };

    (easting, northing)
}

/// Convert UTM (easting, northing) in metres to WGS84 (longitude, latitude)
/// in degrees. Snyder eqs. 8-12 and 8-17 to 8-25.
fn utm_to_wgs84(easting: f64, northing: f64, zone: u32, north: bool) -> (f64, f64) {
    let x = easting - FALSE_EASTING;
    let y = if north {
        northing
    } else {
        northing - FALSE_NORTHING_SOUTH
    };

    let e4 = E2 * E2;
    let e6 = e4 * E2;
    let m = y / K0;
    let mu = m / (A * (1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

    let sqrt_1_e2 = (1.0 - E2).sqrt();
    let e1 = (1.0 - sqrt_1_e2) / (1.0 + sqrt_1_e2);
    let e1_2 = e1 * e1;
    let e1_3 = e1_2 * e1;
    let e1_4 = e1_3 * e1;

    // Footpoint latitude
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1_3 / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1_2 / 16.0 - 55.0 * e1_4 / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1_3 / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1_4 / 512.0) * (8.0 * mu).sin();

    let sin1 = phi1.sin();
    let cos1 = phi1.cos();
    let tan1 = phi1.tan();
    let c1 = E_PRIME2 * cos1 * cos1;
    let t1 = tan1 * tan1;
    let denom = 1.0 - E2 * sin1 * sin1;
    let n1 = A / denom.sqrt();
    let r1 = A * (1.0 - E2) / denom.powf(1.5);
    let d = x / (n1 * K0);

    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d3 * d;
    let d5 = d4 * d;
    let d6 = d5 * d;

    let lat = phi1
        - (n1 * tan1 / r1)
            * (d2 / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * E_PRIME2) * d4 / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * E_PRIME2 - 3.0 * c1 * c1)
                    * d6
                    / 720.0);

    let lon = central_meridian(zone)
        + (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * E_PRIME2 + 24.0 * t1 * t1) * d5
                / 120.0)
            / cos1;

    (lon.to_degrees(), lat.to_degrees())
}

/// Meridional arc from equator to latitude `lat` (radians).
/// Snyder eq. 3-21.
fn meridional_arc(lat: f64) -> f64 {
    let e2 = E2;
    let e4 = e2 * e2;
    let e6 = e4 * e2;

    A * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * lat
        - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * lat).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * lat).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * lat).sin())
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64, msg: &str) {
        let diff = (a - b).abs();
        assert!(
            diff < tol,
            "{msg}: expected {b}, got {a}, diff {diff} exceeds tolerance {tol}"
        );
    }

    #[test]
    fn parse_utm_codes() {
        assert_eq!(parse_utm_epsg(32650), Some((50, true)));
        assert_eq!(parse_utm_epsg(32721), Some((21, false)));
        assert_eq!(parse_utm_epsg(32600), None);
        assert_eq!(parse_utm_epsg(32661), None);
        assert_eq!(parse_utm_epsg(3857), None);
    }

    #[test]
    fn projection_from_epsg() {
        assert_eq!(Projection::from_epsg(4326).unwrap(), Projection::Geographic);
        let utm = Projection::from_epsg(32650).unwrap();
        assert_eq!(utm, Projection::Utm { zone: 50, north: true });
        assert_eq!(utm.epsg(), 32650);
        assert!(matches!(
            Projection::from_epsg(3857),
            Err(CloudError::UnsupportedCrs(_))
        ));
    }

    // Reference: pyproj Transformer.from_crs(4326, 32630).transform(-3.7037, 40.4168)
    #[test]
    fn madrid_wgs84_to_utm30n() {
        let (e, n) = wgs84_to_utm(-3.7037, 40.4168, 30, true);
        assert_close(e, 440_298.94, 1.0, "easting");
        assert_close(n, 4_474_257.31, 1.0, "northing");
    }

    // Reference: pyproj Transformer.from_crs(4326, 32721).transform(-58.3816, -34.6037)
    #[test]
    fn buenos_aires_wgs84_to_utm21s() {
        let (e, n) = wgs84_to_utm(-58.3816, -34.6037, 21, false);
        assert_close(e, 373_317.50, 1.0, "easting");
        assert_close(n, 6_170_036.17, 1.0, "northing");
    }

    #[test]
    fn inverse_recovers_geographic() {
        for &(lon, lat, zone, north) in &[
            (113.65, 34.75, 50, true),
            (111.2, 31.7, 49, true),
            (-58.3816, -34.6037, 21, false),
        ] {
            let (e, n) = wgs84_to_utm(lon, lat, zone, north);
            let (lon2, lat2) = utm_to_wgs84(e, n, zone, north);
            assert_close(lon2, lon, 1e-6, "longitude");
            assert_close(lat2, lat, 1e-6, "latitude");
        }
    }

    #[test]
    fn reproject_bbox_identity_and_utm() {
        let bbox = BBox::new(113.5, 34.5, 114.0, 35.0);
        let geo = Projection::Geographic;
        assert_eq!(reproject_bbox(&bbox, &geo, &geo), bbox);

        let utm = Projection::Utm { zone: 50, north: true };
        let projected = reproject_bbox(&bbox, &geo, &utm);
        // 0.5 degrees ≈ 45 km east-west at 35°N, 55 km north-south
        assert!(projected.width() > 40_000.0 && projected.width() < 50_000.0);
        assert!(projected.height() > 50_000.0 && projected.height() < 60_000.0);

        // Going back covers the original box
        let back = reproject_bbox(&projected, &utm, &geo);
        assert!(back.min_x <= bbox.min_x + 1e-9 && back.max_x >= bbox.max_x - 1e-9);
        assert!(back.min_y <= bbox.min_y + 1e-9 && back.max_y >= bbox.max_y - 1e-9);
    }

    #[test]
    fn resample_nearest_same_projection() {
        let mut src = Raster::from_vec(vec![1.0, 2.0, 3.0, -1.0], 2, 2).unwrap();
        src.set_transform(GeoTransform::new(0.0, 20.0, 10.0, -10.0));
        src.set_nodata(Some(-1.0));

        let utm = Projection::Utm { zone: 50, north: true };
        // 4x4 grid at 5 m covering the source exactly, plus one column east
        let target = GeoTransform::new(0.0, 20.0, 5.0, -5.0);
        let out = resample_nearest(&src, &utm, &target, &utm, 4, 5);

        assert_eq!(out.get(0, 0).unwrap(), 1.0);
        assert_eq!(out.get(1, 3).unwrap(), 2.0);
        assert_eq!(out.get(3, 0).unwrap(), 3.0);
        // Source nodata and off-source pixels become NaN
        assert!(out.get(3, 3).unwrap().is_nan());
        assert!(out.get(0, 4).unwrap().is_nan());
        assert_eq!(out.crs(), Some(&CRS::from_epsg(32650)));
    }
}
