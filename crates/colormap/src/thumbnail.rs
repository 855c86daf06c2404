//! Low-resolution PNG previews of index rasters.

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};
use ndvisync_core::{Raster, RasterElement};
use tracing::debug;

use crate::error::{ColormapError, Result};
use crate::render::{auto_params, raster_to_rgba, ColormapParams};
use crate::scheme::ColorScheme;

/// Options for [`render_thumbnail`].
#[derive(Debug, Clone)]
pub struct ThumbnailOptions {
    /// Bounding box side in pixels; the longer raster side is scaled to it.
    /// Rasters already inside the box keep their size.
    pub max_size: u32,
    pub scheme: ColorScheme,
    /// Fixed value range. `None` stretches the observed min/max.
    pub range: Option<(f64, f64)>,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self {
            max_size: 256,
            scheme: ColorScheme::Grayscale,
            range: None,
        }
    }
}

/// Output size preserving aspect ratio, as (width, height).
pub fn thumbnail_size(rows: usize, cols: usize, max_size: u32) -> (u32, u32) {
    let max_size = max_size.max(1) as usize;
    let longest = rows.max(cols);
    if longest <= max_size {
        return (cols as u32, rows as u32);
    }
    let scale = |dim: usize| -> u32 {
        let scaled = (dim as f64 * max_size as f64 / longest as f64).round() as usize;
        scaled.clamp(1, max_size) as u32
    };
    (scale(cols), scale(rows))
}

/// Box-average `raster` down to `width` x `height`, skipping nodata.
///
/// Blocks with no valid cell become NaN.
fn downsample<T: RasterElement>(raster: &Raster<T>, width: u32, height: u32) -> Raster<f64> {
    let (rows, cols) = raster.shape();
    let (out_rows, out_cols) = (height as usize, width as usize);
    let nodata = raster.nodata();
    let data = raster.data();

    let mut out = Raster::<f64>::filled(out_rows, out_cols, f64::NAN);
    out.set_nodata(Some(f64::NAN));

    for oy in 0..out_rows {
        let r0 = oy * rows / out_rows;
        let r1 = ((oy + 1) * rows / out_rows).max(r0 + 1);
        for ox in 0..out_cols {
            let c0 = ox * cols / out_cols;
            let c1 = ((ox + 1) * cols / out_cols).max(c0 + 1);

            let mut sum = 0.0;
            let mut count = 0usize;
            for r in r0..r1 {
                for c in c0..c1 {
                    let v = data[[r, c]];
                    if v.is_nodata(nodata) {
                        continue;
                    }
                    if let Some(f) = v.to_f64().filter(|f| f.is_finite()) {
                        sum += f;
                        count += 1;
                    }
                }
            }
            if count > 0 {
                out.data_mut()[[oy, ox]] = sum / count as f64;
            }
        }
    }
    out
}

/// Render `raster` as a PNG thumbnail.
///
/// Values are linearly rescaled from the observed (or configured) range to
/// the full scheme; nodata cells are transparent.
pub fn render_thumbnail<T: RasterElement>(raster: &Raster<T>, options: &ThumbnailOptions) -> Result<Vec<u8>> {
    let (rows, cols) = raster.shape();
    if rows == 0 || cols == 0 {
        return Err(ColormapError::EmptyRaster);
    }

    let params = match options.range {
        Some((min, max)) => ColormapParams::with_range(options.scheme, min, max),
        None => auto_params(raster, options.scheme),
    };

    let (width, height) = thumbnail_size(rows, cols, options.max_size);
    let small = downsample(raster, width, height);
    let rgba = raster_to_rgba(&small, &params);

    let image = RgbaImage::from_raw(width, height, rgba).ok_or(ColormapError::BufferSize {
        width,
        height,
    })?;

    let mut cursor = Cursor::new(Vec::new());
    image.write_to(&mut cursor, ImageFormat::Png)?;
    let png = cursor.into_inner();

    debug!(width, height, bytes = png.len(), min = params.min, max = params.max, "thumbnail rendered");
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndvisync_core::INDEX_NODATA;

    fn decode(png: &[u8]) -> RgbaImage {
        image::load_from_memory_with_format(png, ImageFormat::Png)
            .unwrap()
            .to_rgba8()
    }

    #[test]
    fn size_preserves_aspect_ratio() {
        assert_eq!(thumbnail_size(1000, 500, 256), (128, 256));
        assert_eq!(thumbnail_size(300, 3000, 256), (256, 26));
        assert_eq!(thumbnail_size(100, 50, 256), (50, 100));
        assert_eq!(thumbnail_size(10_000, 1, 256), (1, 256));
    }

    #[test]
    fn small_raster_keeps_size_and_stretches_range() {
        let mut r = Raster::<f32>::new(2, 3);
        for (i, v) in r.data_mut().iter_mut().enumerate() {
            *v = 0.2 + 0.1 * i as f32;
        }

        let png = render_thumbnail(&r, &ThumbnailOptions::default()).unwrap();
        let img = decode(&png);

        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(img.get_pixel(2, 1).0, [255, 255, 255, 255]);
    }

    #[test]
    fn large_raster_is_downsampled() {
        let r = Raster::<f32>::filled(600, 300, 0.5);
        let png = render_thumbnail(&r, &ThumbnailOptions::default()).unwrap();
        assert_eq!(decode(&png).dimensions(), (128, 256));
    }

    #[test]
    fn nodata_is_transparent() {
        let mut r = Raster::<f32>::filled(4, 4, 0.6);
        r.set_nodata(Some(INDEX_NODATA));
        for row in 0..4 {
            r.set(row, 0, INDEX_NODATA).unwrap();
            r.set(row, 1, INDEX_NODATA).unwrap();
        }

        let options = ThumbnailOptions {
            max_size: 2,
            ..Default::default()
        };
        let img = decode(&render_thumbnail(&r, &options).unwrap());

        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(0, 0).0[3], 0);
        assert_eq!(img.get_pixel(1, 1).0[3], 255);
    }

    #[test]
    fn fixed_range_is_honoured() {
        let r = Raster::<f64>::filled(1, 1, 0.0);
        let options = ThumbnailOptions {
            range: Some((-1.0, 1.0)),
            ..Default::default()
        };
        let img = decode(&render_thumbnail(&r, &options).unwrap());
        assert_eq!(img.get_pixel(0, 0).0, [128, 128, 128, 255]);
    }

    #[test]
    fn empty_raster_is_rejected() {
        let r = Raster::<f32>::new(0, 0);
        assert!(matches!(
            render_thumbnail(&r, &ThumbnailOptions::default()),
            Err(ColormapError::EmptyRaster)
        ));
    }
}
