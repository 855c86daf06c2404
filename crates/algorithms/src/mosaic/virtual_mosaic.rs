//! Virtual mosaic
//!
//! Sources are registered by header only; pixels are read one source at a
//! time when the mosaic is materialized.

use super::{MosaicError, MosaicResult};
use ndvisync_core::io::{probe_geotiff, read_geotiff, write_geotiff, GeoTiffOptions, RasterHeader};
use ndvisync_core::{GeoTransform, Raster, CRS, INDEX_NODATA};
use std::path::{Path, PathBuf};
use tracing::debug;

const SNAP_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone)]
struct MosaicSource {
    path: PathBuf,
    header: RasterHeader,
}

/// Lazily evaluated union of single-band tiles on a common CRS.
///
/// The output grid takes the first source's pixel size and alignment and
/// spans the union of all source extents. Later sources overwrite earlier
/// ones where they overlap; source nodata is transparent.
#[derive(Debug, Clone)]
pub struct VirtualMosaic {
    sources: Vec<MosaicSource>,
    transform: GeoTransform,
    rows: usize,
    cols: usize,
    crs: Option<CRS>,
}

impl VirtualMosaic {
    /// Probe every source and compute the output grid.
    pub fn build<P: AsRef<Path>>(paths: &[P]) -> MosaicResult<Self> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref().to_path_buf();
            let header = probe_geotiff(&path)?;
            sources.push(MosaicSource { path, header });
        }

        let first = sources.first().ok_or(MosaicError::Empty)?;
        let crs = first.header.crs.clone();

        for source in &sources {
            let incompatible = |reason: String| MosaicError::IncompatibleSource {
                path: source.path.clone(),
                reason,
            };
            if !source.header.transform.is_north_up() {
                return Err(incompatible("rotated or south-up geotransform".into()));
            }
            if source.header.band_count == 0 {
                return Err(incompatible("no bands".into()));
            }
            match (&crs, &source.header.crs) {
                (Some(a), Some(b)) if !a.is_equivalent(b) => {
                    return Err(incompatible(format!("CRS {} differs from {}", b, a)));
                }
                (Some(_), None) | (None, Some(_)) => {
                    return Err(incompatible("missing CRS".into()));
                }
                _ => {}
            }
        }

        let base = first.header.transform;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = first.header.bounds();
        for source in &sources[1..] {
            let (x0, y0, x1, y1) = source.header.bounds();
            min_x = min_x.min(x0);
            min_y = min_y.min(y0);
            max_x = max_x.max(x1);
            max_y = max_y.max(y1);
        }

        // Snap the union onto the first source's pixel grid
        let col0 = ((min_x - base.origin_x) / base.pixel_width + SNAP_TOLERANCE).floor();
        let col1 = ((max_x - base.origin_x) / base.pixel_width - SNAP_TOLERANCE).ceil();
        let row0 = ((max_y - base.origin_y) / base.pixel_height + SNAP_TOLERANCE).floor();
        let row1 = ((min_y - base.origin_y) / base.pixel_height - SNAP_TOLERANCE).ceil();

        let transform = GeoTransform::new(
            base.origin_x + col0 * base.pixel_width,
            base.origin_y + row0 * base.pixel_height,
            base.pixel_width,
            base.pixel_height,
        );
        let cols = (col1 - col0).max(1.0) as usize;
        let rows = (row1 - row0).max(1.0) as usize;

        debug!(sources = sources.len(), rows, cols, "built virtual mosaic");

        Ok(Self {
            sources,
            transform,
            rows,
            cols,
            crs,
        })
    }

    /// (rows, cols) of the output grid
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn crs(&self) -> Option<&CRS> {
        self.crs.as_ref()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Evaluate the mosaic into memory as Float32 with nodata `-9999`.
    pub fn to_raster(&self) -> MosaicResult<Raster<f32>> {
        let mut out = Raster::filled(self.rows, self.cols, INDEX_NODATA);
        out.set_transform(self.transform);
        out.set_crs(self.crs.clone());
        out.set_nodata(Some(INDEX_NODATA));

        for source in &self.sources {
            let tile: Raster<f32> = read_geotiff(&source.path, Some(1))?;
            self.paint(&mut out, &tile);
        }
        Ok(out)
    }

    /// Materialize the mosaic to a single-band GeoTIFF.
    pub fn materialize(&self, output: &Path, options: &GeoTiffOptions) -> MosaicResult<()> {
        let raster = self.to_raster()?;
        write_geotiff(&raster, output, Some(options.clone()))?;
        Ok(())
    }

    /// Nearest-neighbour sample `tile` into every output pixel it covers.
    fn paint(&self, out: &mut Raster<f32>, tile: &Raster<f32>) {
        let (x0, y0, x1, y1) = tile.bounds();
        let (c_start, r_start) = self.transform.geo_to_pixel(x0, y1);
        let (c_end, r_end) = self.transform.geo_to_pixel(x1, y0);

        let c_start = (c_start.floor().max(0.0) as usize).min(self.cols);
        let r_start = (r_start.floor().max(0.0) as usize).min(self.rows);
        let c_end = (c_end.ceil().max(0.0) as usize).min(self.cols);
        let r_end = (r_end.ceil().max(0.0) as usize).min(self.rows);

        let (tile_rows, tile_cols) = tile.shape();
        let src = tile.data();
        let dst = out.data_mut();

        for row in r_start..r_end {
            for col in c_start..c_end {
                let (x, y) = self.transform.pixel_to_geo(col, row);
                let (sc, sr) = tile.geo_to_pixel(x, y);
                if sc < 0.0 || sr < 0.0 {
                    continue;
                }
                let (sc, sr) = (sc.floor() as usize, sr.floor() as usize);
                if sc >= tile_cols || sr >= tile_rows {
                    continue;
                }
                let value = src[(sr, sc)];
                if !tile.is_nodata(value) {
                    dst[(row, col)] = value;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::write_tile;
    use super::*;

    #[test]
    fn test_union_grid_and_overlap_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tile(dir.path(), "a.tif", (0.0, 3.0), (3, 3), 1.0, CRS::wgs84());
        let b = write_tile(dir.path(), "b.tif", (2.0, 4.0), (3, 3), 2.0, CRS::wgs84());

        let mosaic = VirtualMosaic::build(&[&a, &b]).unwrap();
        assert_eq!(mosaic.shape(), (4, 5));
        assert_eq!(mosaic.transform().origin_x, 0.0);
        assert_eq!(mosaic.transform().origin_y, 4.0);

        let raster = mosaic.to_raster().unwrap();
        // Top row only covered by b
        assert_eq!(raster.get(0, 0).unwrap(), INDEX_NODATA);
        assert_eq!(raster.get(0, 2).unwrap(), 2.0);
        // Overlap: later source wins
        assert_eq!(raster.get(1, 2).unwrap(), 2.0);
        assert_eq!(raster.get(1, 1).unwrap(), 1.0);
        // Bottom-right only covered by neither
        assert_eq!(raster.get(3, 4).unwrap(), INDEX_NODATA);
    }

    #[test]
    fn test_nodata_is_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tile(dir.path(), "a.tif", (0.0, 2.0), (2, 2), 0.5, CRS::wgs84());
        let b = write_tile(dir.path(), "b.tif", (0.0, 2.0), (2, 2), -9999.0, CRS::wgs84());

        let raster = VirtualMosaic::build(&[a, b]).unwrap().to_raster().unwrap();
        assert!(raster.data().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = vec![
            write_tile(dir.path(), "a.tif", (0.0, 3.0), (3, 3), 0.2, CRS::from_epsg(32650)),
            write_tile(dir.path(), "b.tif", (1.0, 2.0), (3, 3), 0.7, CRS::from_epsg(32650)),
        ];
        let first = dir.path().join("m1.tif");
        let second = dir.path().join("m2.tif");

        let mosaic = VirtualMosaic::build(&tiles).unwrap();
        mosaic.materialize(&first, &GeoTiffOptions::lzw()).unwrap();
        VirtualMosaic::build(&tiles)
            .unwrap()
            .materialize(&second, &GeoTiffOptions::lzw())
            .unwrap();

        let a: Raster<f32> = read_geotiff(&first, None).unwrap();
        let b: Raster<f32> = read_geotiff(&second, None).unwrap();
        assert_eq!(a.data(), b.data());
        assert_eq!(a.transform(), b.transform());
    }

    #[test]
    fn test_rejects_crs_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tile(dir.path(), "a.tif", (0.0, 2.0), (2, 2), 0.5, CRS::from_epsg(32650));
        let b = write_tile(dir.path(), "b.tif", (0.0, 2.0), (2, 2), 0.5, CRS::wgs84());
        assert!(matches!(
            VirtualMosaic::build(&[a, b]),
            Err(MosaicError::IncompatibleSource { .. })
        ));
    }
}
