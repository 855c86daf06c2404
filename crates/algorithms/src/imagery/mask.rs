//! Clear-sky masking
//!
//! A pixel is clear when none of the scene's cloud/cirrus quality bits are
//! set and the per-pixel cloud probability is below a fixed ceiling.

use ndarray::{Array2, Zip};
use ndvisync_core::raster::Raster;
use ndvisync_core::{Error, Result};

use super::indices::check_dimensions;

/// Parameters for [`clear_sky_mask`]
#[derive(Debug, Clone)]
pub struct CloudMaskParams {
    /// Quality-band bits that flag opaque cloud and cirrus
    pub quality_bits: u32,
    /// Pixels with cloud probability at or above this percentage are masked
    pub max_probability: f64,
}

impl Default for CloudMaskParams {
    fn default() -> Self {
        Self {
            quality_bits: 0b11 << 10,
            max_probability: 15.0,
        }
    }
}

/// Build the clear-sky mask (`true` = keep) from a quality band and a
/// cloud-probability band on the same grid.
///
/// Nodata in either input masks the pixel.
pub fn clear_sky_mask(
    quality: &Raster<f64>,
    probability: &Raster<f64>,
    params: &CloudMaskParams,
) -> Result<Array2<bool>> {
    check_dimensions(quality, probability)?;

    let mut mask = Array2::from_elem(quality.shape(), false);
    Zip::from(&mut mask)
        .and(quality.data())
        .and(probability.data())
        .for_each(|keep, &qa, &prob| {
            if quality.is_nodata(qa) || probability.is_nodata(prob) || qa < 0.0 {
                return;
            }
            let flags = qa as u32;
            *keep = flags & params.quality_bits == 0 && prob < params.max_probability;
        });

    Ok(mask)
}

/// Set every masked pixel (`false` in `mask`) of `band` to NaN.
pub fn apply_mask(band: &mut Raster<f64>, mask: &Array2<bool>) -> Result<()> {
    if band.shape() != mask.dim() {
        let (mr, mc) = mask.dim();
        return Err(Error::SizeMismatch {
            er: band.rows(),
            ec: band.cols(),
            ar: mr,
            ac: mc,
        });
    }

    Zip::from(band.data_mut()).and(mask).for_each(|v, &keep| {
        if !keep {
            *v = f64::NAN;
        }
    });
    Ok(())
}
