//! Pixel value trait

use num_traits::{NumCast, Zero};
use std::fmt::Debug;

/// Types a raster cell can hold.
///
/// Source imagery arrives as unsigned integers (reflectance, quality bits,
/// cloud probability); everything the pipeline derives is floating point.
pub trait RasterElement:
    Copy + Clone + Debug + PartialOrd + PartialEq + NumCast + Zero + Send + Sync + 'static
{
    /// Default no-data value for this type
    fn default_nodata() -> Self;

    /// Check if this value represents no-data
    fn is_nodata(&self, nodata: Option<Self>) -> bool;

    /// Whether this type is a floating point type
    fn is_float() -> bool;

    /// Convert self to f64
    fn to_f64(self) -> Option<f64> {
        NumCast::from(self)
    }
}

macro_rules! impl_raster_element_int {
    ($t:ty) => {
        impl RasterElement for $t {
            fn default_nodata() -> Self {
                <$t>::MAX
            }

            fn is_nodata(&self, nodata: Option<Self>) -> bool {
                nodata.map_or(false, |nd| *self == nd)
            }

            fn is_float() -> bool {
                false
            }
        }
    };
}

macro_rules! impl_raster_element_float {
    ($t:ty) => {
        impl RasterElement for $t {
            fn default_nodata() -> Self {
                <$t>::NAN
            }

            // NaN is always treated as missing, whatever the declared sentinel
            fn is_nodata(&self, nodata: Option<Self>) -> bool {
                if self.is_nan() {
                    return true;
                }
                match nodata {
                    Some(nd) => (self - nd).abs() < <$t>::EPSILON * 100.0,
                    None => false,
                }
            }

            fn is_float() -> bool {
                true
            }
        }
    };
}

impl_raster_element_int!(u8);
impl_raster_element_int!(u16);
impl_raster_element_int!(i16);
impl_raster_element_int!(u32);
impl_raster_element_float!(f32);
impl_raster_element_float!(f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_always_nodata() {
        assert!(f32::NAN.is_nodata(None));
        assert!(f32::NAN.is_nodata(Some(-9999.0)));
        assert!(!f32::INFINITY.is_nodata(Some(-9999.0)));
    }

    #[test]
    fn sentinel_matches() {
        assert!((-9999.0f32).is_nodata(Some(-9999.0)));
        assert!(0u16.is_nodata(Some(0)));
        assert!(!1u16.is_nodata(Some(0)));
        assert!(!0u16.is_nodata(None));
    }
}
