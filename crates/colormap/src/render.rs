//! Raster-to-RGBA rendering using color schemes.

use crate::scheme::{evaluate, ColorScheme, Rgb};
use ndvisync_core::{Raster, RasterElement};

/// Parameters for colormap rendering.
#[derive(Debug, Clone)]
pub struct ColormapParams {
    pub scheme: ColorScheme,
    /// Value mapped to the start of the scheme. Lower values are clamped.
    pub min: f64,
    /// Value mapped to the end of the scheme. Higher values are clamped.
    pub max: f64,
    /// RGBA written for nodata pixels. Default: fully transparent.
    pub nodata_color: [u8; 4],
}

impl ColormapParams {
    /// Params over the full NDVI domain, -1 to 1.
    pub fn ndvi(scheme: ColorScheme) -> Self {
        Self::with_range(scheme, -1.0, 1.0)
    }

    pub fn with_range(scheme: ColorScheme, min: f64, max: f64) -> Self {
        Self {
            scheme,
            min,
            max,
            nodata_color: [0, 0, 0, 0],
        }
    }

    /// Position of `value` along the scheme, unclamped.
    pub fn normalize(&self, value: f64) -> f64 {
        let range = self.max - self.min;
        if range.abs() > f64::EPSILON {
            (value - self.min) / range
        } else {
            0.0
        }
    }
}

/// Observed finite range of the valid cells of `raster`, or `None` when
/// there are none.
pub fn observed_range<T: RasterElement>(raster: &Raster<T>) -> Option<(f64, f64)> {
    let nodata = raster.nodata();
    raster
        .data()
        .iter()
        .filter(|v| !v.is_nodata(nodata))
        .filter_map(|v| v.to_f64())
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Params stretched over the observed data range.
///
/// An all-nodata raster falls back to [0, 1]. A constant raster maps its
/// single value to the start of the scheme.
pub fn auto_params<T: RasterElement>(raster: &Raster<T>, scheme: ColorScheme) -> ColormapParams {
    let (min, max) = observed_range(raster).unwrap_or((0.0, 1.0));
    ColormapParams::with_range(scheme, min, max)
}

/// Convert a raster to an RGBA pixel buffer of length `rows * cols * 4`,
/// row-major. Nodata and non-finite cells get `params.nodata_color`.
pub fn raster_to_rgba<T: RasterElement>(raster: &Raster<T>, params: &ColormapParams) -> Vec<u8> {
    let nodata = raster.nodata();
    let mut rgba = Vec::with_capacity(raster.len() * 4);

    for val in raster.data().iter() {
        let value = if val.is_nodata(nodata) { None } else { val.to_f64() };
        match value {
            Some(v) if v.is_finite() => {
                let Rgb { r, g, b } = evaluate(params.scheme, params.normalize(v));
                rgba.extend_from_slice(&[r, g, b, 255]);
            }
            _ => rgba.extend_from_slice(&params.nodata_color),
        }
    }

    rgba
}
