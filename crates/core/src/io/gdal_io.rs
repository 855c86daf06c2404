//! GeoTIFF reading and writing using GDAL

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::io::{GeoTiffOptions, RasterHeader};
use crate::raster::{GeoTransform, Raster, RasterElement};
use gdal::raster::{Buffer, GdalType, RasterCreationOptions};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use std::path::Path;

fn dataset_crs(dataset: &Dataset) -> Option<CRS> {
    let srs = dataset.spatial_ref().ok()?;
    match srs.auth_code() {
        Ok(code) => Some(CRS::from_epsg(code as u32)),
        Err(_) => srs.to_wkt().ok().map(CRS::from_wkt),
    }
}

/// Read dimensions, georeferencing and nodata without reading pixels
pub fn probe_geotiff<P: AsRef<Path>>(path: P) -> Result<RasterHeader> {
    let dataset = Dataset::open(path.as_ref())?;
    let (cols, rows) = dataset.raster_size();
    let band = dataset.rasterband(1)?;

    Ok(RasterHeader {
        rows,
        cols,
        band_count: dataset.raster_count() as usize,
        transform: dataset
            .geo_transform()
            .map(GeoTransform::from_gdal)
            .unwrap_or_default(),
        crs: dataset_crs(&dataset),
        nodata: band.no_data_value(),
    })
}

/// Read one band of a GeoTIFF file into a Raster
///
/// `band` is 1-indexed and defaults to 1.
pub fn read_geotiff<T, P>(path: P, band: Option<usize>) -> Result<Raster<T>>
where
    T: RasterElement + GdalType,
    P: AsRef<Path>,
{
    let header = probe_geotiff(path.as_ref())?;
    read_block(path.as_ref(), band.unwrap_or(1), 0, 0, header.cols, header.rows)
}

/// Read the `cols` x `rows` window at (`col_off`, `row_off`) from band 1
pub fn read_geotiff_window<T, P>(
    path: P,
    col_off: usize,
    row_off: usize,
    cols: usize,
    rows: usize,
) -> Result<Raster<T>>
where
    T: RasterElement + GdalType,
    P: AsRef<Path>,
{
    let header = probe_geotiff(path.as_ref())?;
    if col_off + cols > header.cols || row_off + rows > header.rows {
        return Err(Error::WindowOutOfBounds {
            col_off,
            row_off,
            cols,
            rows,
            raster_rows: header.rows,
            raster_cols: header.cols,
        });
    }
    read_block(path.as_ref(), 1, col_off, row_off, cols, rows)
}

fn read_block<T: RasterElement + GdalType>(
    path: &Path,
    band: usize,
    col_off: usize,
    row_off: usize,
    cols: usize,
    rows: usize,
) -> Result<Raster<T>> {
    let dataset = Dataset::open(path)?;
    let rasterband = dataset.rasterband(band)?;
    let buffer = rasterband.read_as::<T>(
        (col_off as isize, row_off as isize),
        (cols, rows),
        (cols, rows),
        None,
    )?;

    let mut raster = Raster::from_vec(buffer.data().to_vec(), rows, cols)?;
    if let Ok(gt) = dataset.geo_transform() {
        raster.set_transform(GeoTransform::from_gdal(gt).window(col_off, row_off));
    }
    raster.set_crs(dataset_crs(&dataset));
    raster.set_nodata(rasterband.no_data_value().and_then(num_traits::cast));
    Ok(raster)
}

/// Write a Raster to a GeoTIFF file
pub fn write_geotiff<T, P>(
    raster: &Raster<T>,
    path: P,
    options: Option<GeoTiffOptions>,
) -> Result<()>
where
    T: RasterElement + GdalType,
    P: AsRef<Path>,
{
    let opts = options.unwrap_or_default();
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (rows, cols) = raster.shape();

    let mut create_options = RasterCreationOptions::new();
    create_options.add_name_value("COMPRESS", &opts.compression.to_ascii_uppercase())?;
    if opts.compression.eq_ignore_ascii_case("DEFLATE") {
        create_options.add_name_value("ZLEVEL", &opts.level.clamp(1, 9).to_string())?;
    }
    if opts.tile_size > 0 {
        let block = opts.tile_size.to_string();
        create_options.add_name_value("TILED", "YES")?;
        create_options.add_name_value("BLOCKXSIZE", &block)?;
        create_options.add_name_value("BLOCKYSIZE", &block)?;
    }

    let mut dataset = driver.create_with_band_type_with_options::<T, _>(
        path.as_ref(),
        cols,
        rows,
        1,
        &create_options,
    )?;

    dataset.set_geo_transform(&raster.transform().to_gdal())?;

    if let Some(crs) = raster.crs() {
        if let Some(epsg) = crs.epsg() {
            dataset.set_spatial_ref(&SpatialRef::from_epsg(epsg)?)?;
        } else if let Some(wkt) = crs.wkt() {
            dataset.set_spatial_ref(&SpatialRef::from_wkt(wkt)?)?;
        }
    }

    let mut band = dataset.rasterband(1)?;
    if let Some(nd) = raster.nodata().and_then(|v| v.to_f64()) {
        band.set_no_data_value(Some(nd))?;
    }

    let mut buffer = Buffer::new((cols, rows), raster.data().iter().copied().collect());
    band.write((0, 0), (cols, rows), &mut buffer)?;

    Ok(())
}
