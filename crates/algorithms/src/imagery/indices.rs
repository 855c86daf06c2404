//! Normalized difference vegetation index
//!
//! All functions operate on single-band rasters (one band per raster)
//! and return NaN where a pixel is undefined.

use crate::maybe_rayon::*;
use ndarray::Array2;
use ndvisync_core::raster::Raster;
use ndvisync_core::{Error, Result, INDEX_NODATA};

/// Parameters for the normalized difference
#[derive(Debug, Clone)]
pub struct NormalizedDifferenceParams {
    /// Added to the denominator. Zero reproduces the textbook formula
    /// and leaves `a + b == 0` pixels undefined.
    pub epsilon: f64,
}

impl Default for NormalizedDifferenceParams {
    fn default() -> Self {
        Self { epsilon: 0.0 }
    }
}

/// Compute the normalized difference between two bands:
///
/// `(band_a - band_b) / (band_a + band_b)`
///
/// Pixels where either band is nodata (or NaN), or where the denominator
/// vanishes, are set to NaN.
pub fn normalized_difference(band_a: &Raster<f64>, band_b: &Raster<f64>) -> Result<Raster<f64>> {
    normalized_difference_with(band_a, band_b, &NormalizedDifferenceParams::default())
}

/// [`normalized_difference`] with an explicit denominator offset
pub fn normalized_difference_with(
    band_a: &Raster<f64>,
    band_b: &Raster<f64>,
    params: &NormalizedDifferenceParams,
) -> Result<Raster<f64>> {
    check_dimensions(band_a, band_b)?;

    let (rows, cols) = band_a.shape();
    let a = band_a.data();
    let b = band_b.data();
    let epsilon = params.epsilon;

    let data: Vec<f64> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut row_data = vec![f64::NAN; cols];
            for (col, out) in row_data.iter_mut().enumerate() {
                let va = a[(row, col)];
                let vb = b[(row, col)];

                if band_a.is_nodata(va) || band_b.is_nodata(vb) {
                    continue;
                }

                let sum = va + vb + epsilon;
                if sum.abs() < 1e-12 {
                    continue;
                }

                *out = (va - vb) / sum;
            }
            row_data
        })
        .collect();

    build_output(band_a, rows, cols, data)
}

/// Normalized Difference Vegetation Index
///
/// `NDVI = (NIR - Red) / (NIR + Red)`
///
/// Values range from -1 to 1; dense vegetation sits around 0.6 to 0.9,
/// water and clouds below 0.
pub fn ndvi(nir: &Raster<f64>, red: &Raster<f64>) -> Result<Raster<f64>> {
    normalized_difference(nir, red)
}

/// Convert an index raster to the on-disk form: Float32 with NaN
/// replaced by [`INDEX_NODATA`].
pub fn to_index_raster(index: &Raster<f64>) -> Raster<f32> {
    let (rows, cols) = index.shape();
    let mut out = index.with_same_meta::<f32>(rows, cols);
    out.data_mut().zip_mut_with(index.data(), |o, &v| {
        *o = if v.is_finite() { v as f32 } else { INDEX_NODATA };
    });
    out.set_nodata(Some(INDEX_NODATA));
    out
}

pub(crate) fn check_dimensions(a: &Raster<f64>, b: &Raster<f64>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::SizeMismatch {
            er: a.rows(),
            ec: a.cols(),
            ar: b.rows(),
            ac: b.cols(),
        });
    }
    Ok(())
}

pub(crate) fn build_output(
    template: &Raster<f64>,
    rows: usize,
    cols: usize,
    data: Vec<f64>,
) -> Result<Raster<f64>> {
    let mut output = template.with_same_meta::<f64>(rows, cols);
    output.set_nodata(Some(f64::NAN));
    *output.data_mut() =
        Array2::from_shape_vec((rows, cols), data).map_err(|e| Error::Other(e.to_string()))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndvisync_core::GeoTransform;

    fn make_band(rows: usize, cols: usize, value: f64) -> Raster<f64> {
        let mut r = Raster::filled(rows, cols, value);
        r.set_transform(GeoTransform::new(0.0, rows as f64, 1.0, -1.0));
        r
    }

    #[test]
    fn test_ndvi() {
        let nir = make_band(5, 5, 0.5);
        let red = make_band(5, 5, 0.1);

        let result = ndvi(&nir, &red).unwrap();
        let val = result.get(2, 2).unwrap();

        let expected = (0.5 - 0.1) / (0.5 + 0.1);
        assert!((val - expected).abs() < 1e-10, "Expected {}, got {}", expected, val);
    }

    #[test]
    fn test_ndvi_water_is_negative() {
        let nir = make_band(5, 5, 0.05);
        let red = make_band(5, 5, 0.15);

        let val = ndvi(&nir, &red).unwrap().get(2, 2).unwrap();
        assert!(val < 0.0, "water should be negative, got {}", val);
    }

    #[test]
    fn test_nodata_and_zero_sum_are_nan() {
        let mut nir = make_band(3, 3, 0.0);
        let mut red = make_band(3, 3, 0.0);
        nir.set(0, 0, 900.0).unwrap();
        red.set(0, 0, 100.0).unwrap();
        nir.set(1, 1, -9999.0).unwrap();
        nir.set_nodata(Some(-9999.0));
        red.set_nodata(Some(-9999.0));

        let result = ndvi(&nir, &red).unwrap();
        assert!((result.get(0, 0).unwrap() - 0.8).abs() < 1e-10);
        assert!(result.get(1, 1).unwrap().is_nan());
        assert!(result.get(2, 2).unwrap().is_nan());
    }

    #[test]
    fn test_epsilon_defines_zero_pixels() {
        let nir = make_band(2, 2, 0.0);
        let red = make_band(2, 2, 0.0);
        let params = NormalizedDifferenceParams { epsilon: 1e-10 };

        let result = normalized_difference_with(&nir, &red, &params).unwrap();
        assert_eq!(result.get(0, 0).unwrap(), 0.0);
    }

    #[test]
    fn test_size_mismatch() {
        let a = make_band(3, 3, 1.0);
        let b = make_band(3, 4, 1.0);
        assert!(ndvi(&a, &b).is_err());
    }

    #[test]
    fn test_to_index_raster_fills_sentinel() {
        let mut index = make_band(2, 2, 0.42);
        index.set(1, 0, f64::NAN).unwrap();

        let out = to_index_raster(&index);
        assert_eq!(out.nodata(), Some(INDEX_NODATA));
        assert_eq!(out.get(1, 0).unwrap(), INDEX_NODATA);
        assert!((out.get(0, 0).unwrap() - 0.42).abs() < 1e-6);
    }
}
