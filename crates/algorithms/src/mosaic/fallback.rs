//! Pixel-copy merge
//!
//! The first tile is the template for transform, CRS, pixel type and
//! nodata. Every tile is placed at its integer pixel offset inside the
//! template grid; overlapping pixels are overwritten (last write wins).

use super::{MergePath, MergeReport, MosaicError, MosaicResult};
use ndarray::s;
use ndvisync_core::io::{read_geotiff, write_geotiff, GeoTiffOptions};
use ndvisync_core::{GeoTransform, Raster, INDEX_NODATA};
use std::path::Path;
use tracing::{debug, warn};

/// Relative pixel-size tolerance for accepting a tile onto the template grid
const RESOLUTION_TOLERANCE: f64 = 1e-6;

/// Half-open pixel rectangle in template grid space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelExtent {
    col0: isize,
    row0: isize,
    col1: isize,
    row1: isize,
}

impl PixelExtent {
    fn of((col, row): (isize, isize), tile: &Raster<f32>) -> Self {
        Self {
            col0: col,
            row0: row,
            col1: col + tile.cols() as isize,
            row1: row + tile.rows() as isize,
        }
    }

    /// Overlapping or sharing an edge or corner
    fn touches(&self, other: &Self) -> bool {
        self.col0 <= other.col1 && other.col0 <= self.col1 && self.row0 <= other.row1 && other.row0 <= self.row1
    }

    fn union(&self, other: &Self) -> Self {
        Self {
            col0: self.col0.min(other.col0),
            row0: self.row0.min(other.row0),
            col1: self.col1.max(other.col1),
            row1: self.row1.max(other.row1),
        }
    }
}

/// Merge `tiles` into `output` by raw block copies.
///
/// The output grid starts as the template's and grows only by tiles
/// connected to it through touching or overlapping tiles. Tiles in
/// another CRS, with another pixel size, or disconnected from the
/// template block are skipped with a warning and counted in
/// `tiles_skipped`.
pub fn merge_fallback<P: AsRef<Path>>(
    tiles: &[P],
    output: &Path,
    options: &GeoTiffOptions,
) -> MosaicResult<MergeReport> {
    let (first, rest) = tiles.split_first().ok_or(MosaicError::Empty)?;
    let template: Raster<f32> = read_geotiff(first.as_ref(), Some(1))?;
    let base = *template.transform();
    let tolerance = base.cell_size() * RESOLUTION_TOLERANCE;

    let mut candidates: Vec<(String, (isize, isize), Raster<f32>)> = Vec::with_capacity(rest.len());
    let mut skipped = 0;

    for path in rest {
        let path = path.as_ref();
        let tile: Raster<f32> = read_geotiff(path, Some(1))?;
        if let (Some(expected), Some(found)) = (template.crs(), tile.crs()) {
            if expected != found {
                warn!(tile = %path.display(), expected = %expected, found = %found, "CRS differs from template, skipping");
                skipped += 1;
                continue;
            }
        }
        if !tile.transform().same_resolution(&base, tolerance) {
            warn!(tile = %path.display(), "pixel size differs from template, skipping");
            skipped += 1;
            continue;
        }
        let offset = base.pixel_offset_of(tile.transform());
        candidates.push((path.display().to_string(), offset, tile));
    }

    // Grow from the template until no remaining tile touches the block
    let mut extent = PixelExtent::of((0, 0), &template);
    let mut connected = vec![false; candidates.len()];
    loop {
        let mut grew = false;
        for (i, (_, offset, tile)) in candidates.iter().enumerate() {
            let tile_extent = PixelExtent::of(*offset, tile);
            if !connected[i] && extent.touches(&tile_extent) {
                extent = extent.union(&tile_extent);
                connected[i] = true;
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    let mut accepted: Vec<((isize, isize), Raster<f32>)> = vec![((0, 0), template)];
    for ((name, offset, tile), keep) in candidates.into_iter().zip(connected) {
        if keep {
            accepted.push((offset, tile));
        } else {
            warn!(tile = %name, col = offset.0, row = offset.1, "tile is disconnected from the template, skipping");
            skipped += 1;
        }
    }

    let out_cols = (extent.col1 - extent.col0) as usize;
    let out_rows = (extent.row1 - extent.row0) as usize;
    let (origin_x, origin_y) = (
        base.origin_x + extent.col0 as f64 * base.pixel_width,
        base.origin_y + extent.row0 as f64 * base.pixel_height,
    );

    let nodata = accepted[0].1.nodata().unwrap_or(INDEX_NODATA);
    let mut out = accepted[0].1.with_same_meta::<f32>(out_rows, out_cols);
    out.data_mut().fill(nodata);
    out.set_transform(GeoTransform::new(
        origin_x,
        origin_y,
        base.pixel_width,
        base.pixel_height,
    ));
    out.set_nodata(Some(nodata));

    let mut used = 0;
    for ((col, row), tile) in &accepted {
        let (dst_col, dst_row) = (col - extent.col0, row - extent.row0);
        if copy_block(&mut out, tile, dst_col, dst_row) {
            used += 1;
        } else {
            warn!(col = dst_col, row = dst_row, "tile falls outside the mosaic, skipping");
            skipped += 1;
        }
    }

    write_geotiff(&out, output, Some(options.clone()))?;
    debug!(rows = out_rows, cols = out_cols, used, skipped, "pixel-copy merge done");

    Ok(MergeReport {
        path: MergePath::Fallback,
        rows: out_rows,
        cols: out_cols,
        tiles_used: used,
        tiles_skipped: skipped,
    })
}

/// Copy `tile` into `out` with its top-left at (`dst_col`, `dst_row`),
/// clipping to `out`. Returns false when nothing overlaps.
fn copy_block(out: &mut Raster<f32>, tile: &Raster<f32>, dst_col: isize, dst_row: isize) -> bool {
    let (out_rows, out_cols) = (out.rows() as isize, out.cols() as isize);
    let (tile_rows, tile_cols) = (tile.rows() as isize, tile.cols() as isize);

    let src_c0 = (-dst_col).max(0);
    let src_r0 = (-dst_row).max(0);
    let dst_c0 = dst_col.max(0);
    let dst_r0 = dst_row.max(0);
    let width = (tile_cols - src_c0).min(out_cols - dst_c0);
    let height = (tile_rows - src_r0).min(out_rows - dst_r0);

    if width <= 0 || height <= 0 || dst_c0 >= out_cols || dst_r0 >= out_rows {
        return false;
    }

    let (src_c0, src_r0, dst_c0, dst_r0) = (
        src_c0 as usize,
        src_r0 as usize,
        dst_c0 as usize,
        dst_r0 as usize,
    );
    let (width, height) = (width as usize, height as usize);

    out.data_mut()
        .slice_mut(s![dst_r0..dst_r0 + height, dst_c0..dst_c0 + width])
        .assign(&tile.data().slice(s![src_r0..src_r0 + height, src_c0..src_c0 + width]));
    true
}

#[cfg(test)]
mod tests {
    use super::super::test_support::write_tile;
    use super::*;
    use ndvisync_core::CRS;

    #[test]
    fn test_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tile(dir.path(), "a.tif", (0.0, 2.0), (2, 3), 0.1, CRS::wgs84());
        let b = write_tile(dir.path(), "b.tif", (1.0, 2.0), (2, 3), 0.9, CRS::wgs84());
        let out = dir.path().join("out.tif");

        let report = merge_fallback(&[a, b], &out, &GeoTiffOptions::lzw()).unwrap();
        assert_eq!((report.rows, report.cols), (2, 4));
        assert_eq!(report.tiles_used, 2);

        let merged: Raster<f32> = read_geotiff(&out, None).unwrap();
        assert_eq!(merged.get(0, 0).unwrap(), 0.1);
        assert_eq!(merged.get(0, 1).unwrap(), 0.9);
        assert_eq!(merged.get(1, 3).unwrap(), 0.9);
    }

    #[test]
    fn test_tile_west_of_template_extends_grid() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tile(dir.path(), "a.tif", (2.0, 2.0), (2, 2), 0.5, CRS::wgs84());
        let b = write_tile(dir.path(), "b.tif", (0.0, 2.0), (2, 2), 0.6, CRS::wgs84());
        let out = dir.path().join("out.tif");

        merge_fallback(&[a, b], &out, &GeoTiffOptions::lzw()).unwrap();
        let merged: Raster<f32> = read_geotiff(&out, None).unwrap();
        assert_eq!(merged.transform().origin_x, 0.0);
        assert_eq!(merged.get(0, 0).unwrap(), 0.6);
        assert_eq!(merged.get(0, 3).unwrap(), 0.5);
    }

    #[test]
    fn test_skips_mismatched_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tile(dir.path(), "a.tif", (0.0, 2.0), (2, 2), 0.5, CRS::wgs84());

        let mut coarse = Raster::filled(1, 1, 0.8f32);
        coarse.set_transform(GeoTransform::new(0.0, 2.0, 2.0, -2.0));
        let b = dir.path().join("b.tif");
        write_geotiff(&coarse, &b, None).unwrap();

        let out = dir.path().join("out.tif");
        let report = merge_fallback(&[a, b], &out, &GeoTiffOptions::lzw()).unwrap();
        assert_eq!(report.tiles_used, 1);
        assert_eq!(report.tiles_skipped, 1);
    }

    #[test]
    fn test_skips_tile_in_other_crs() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tile(dir.path(), "a.tif", (0.0, 2.0), (2, 2), 0.3, CRS::from_epsg(32650));
        let b = write_tile(dir.path(), "b.tif", (100_000.0, 2.0), (2, 2), 0.4, CRS::from_epsg(32651));
        let out = dir.path().join("out.tif");

        let report = merge_fallback(&[a, b], &out, &GeoTiffOptions::lzw()).unwrap();
        assert_eq!((report.rows, report.cols), (2, 2));
        assert_eq!(report.tiles_used, 1);
        assert_eq!(report.tiles_skipped, 1);

        let merged: Raster<f32> = read_geotiff(&out, None).unwrap();
        assert!(merged.data().iter().all(|&v| v == 0.3));
    }

    #[test]
    fn test_skips_disconnected_tile() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tile(dir.path(), "a.tif", (0.0, 2.0), (2, 2), 0.1, CRS::wgs84());
        let far = write_tile(dir.path(), "far.tif", (100_000.0, 2.0), (2, 2), 0.2, CRS::wgs84());
        let b = write_tile(dir.path(), "b.tif", (2.0, 2.0), (2, 2), 0.3, CRS::wgs84());
        let out = dir.path().join("out.tif");

        let report = merge_fallback(&[a, far, b], &out, &GeoTiffOptions::lzw()).unwrap();
        assert_eq!((report.rows, report.cols), (2, 4));
        assert_eq!(report.tiles_used, 2);
        assert_eq!(report.tiles_skipped, 1);
    }

    #[test]
    fn test_chain_connects_through_later_tiles() {
        let dir = tempfile::tempdir().unwrap();
        // c only touches the template through b, which comes after it
        let a = write_tile(dir.path(), "a.tif", (0.0, 2.0), (2, 2), 0.1, CRS::wgs84());
        let c = write_tile(dir.path(), "c.tif", (4.0, 2.0), (2, 2), 0.3, CRS::wgs84());
        let b = write_tile(dir.path(), "b.tif", (2.0, 2.0), (2, 2), 0.2, CRS::wgs84());
        let out = dir.path().join("out.tif");

        let report = merge_fallback(&[a, c, b], &out, &GeoTiffOptions::lzw()).unwrap();
        assert_eq!((report.rows, report.cols), (2, 6));
        assert_eq!(report.tiles_used, 3);

        let merged: Raster<f32> = read_geotiff(&out, None).unwrap();
        assert_eq!(merged.get(0, 5).unwrap(), 0.3);
    }

    #[test]
    fn test_copy_block_clips() {
        let mut out = Raster::filled(3, 3, 0.0f32);
        let tile = Raster::filled(2, 2, 1.0f32);

        assert!(copy_block(&mut out, &tile, 2, 2));
        assert_eq!(out.get(2, 2).unwrap(), 1.0);
        assert_eq!(out.get(1, 1).unwrap(), 0.0);

        assert!(copy_block(&mut out, &tile, -1, -1));
        assert_eq!(out.get(0, 0).unwrap(), 1.0);
        assert_eq!(out.get(1, 0).unwrap(), 0.0);

        assert!(!copy_block(&mut out, &tile, 3, 0));
        assert!(!copy_block(&mut out, &tile, -2, 0));
    }

    #[test]
    fn test_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tiles = vec![
            write_tile(dir.path(), "a.tif", (0.0, 3.0), (3, 3), 0.25, CRS::wgs84()),
            write_tile(dir.path(), "b.tif", (2.0, 2.0), (3, 3), 0.75, CRS::wgs84()),
        ];
        let one = dir.path().join("one.tif");
        let two = dir.path().join("two.tif");
        merge_fallback(&tiles, &one, &GeoTiffOptions::lzw()).unwrap();
        merge_fallback(&tiles, &two, &GeoTiffOptions::lzw()).unwrap();

        let a: Raster<f32> = read_geotiff(&one, None).unwrap();
        let b: Raster<f32> = read_geotiff(&two, None).unwrap();
        assert_eq!(a.data(), b.data());
    }
}
