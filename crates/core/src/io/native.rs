//! Native GeoTIFF reading/writing (without GDAL dependency)
//!
//! Uses the `tiff` crate for strip/tile I/O and handles the GeoTIFF tags
//! the pipeline relies on: pixel scale + tiepoint (or a full model
//! transformation), the EPSG code in the GeoKey directory and the
//! `GDAL_NODATA` ASCII tag.

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::io::{GeoTiffOptions, RasterHeader};
use crate::raster::{GeoTransform, Raster, RasterElement};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::compression::{Compression, Deflate, DeflateLevel, Lzw, Uncompressed};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;
use tracing::debug;

// GeoKey ids and values (GeoTIFF 1.1, section 6)
const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const USER_DEFINED: u16 = 32767;

fn buffer_label() -> &'static Path {
    Path::new("<buffer>")
}

/// Read one band of a GeoTIFF file into a Raster
///
/// `band` is 1-indexed and defaults to 1.
pub fn read_geotiff<T, P>(path: P, band: Option<usize>) -> Result<Raster<T>>
where
    T: RasterElement,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = BufReader::new(File::open(path)?);
    decode_geotiff(file, band, path)
}

/// Read a GeoTIFF from an in-memory buffer into a Raster
pub fn read_geotiff_from_buffer<T>(data: &[u8], band: Option<usize>) -> Result<Raster<T>>
where
    T: RasterElement,
{
    decode_geotiff(Cursor::new(data), band, buffer_label())
}

/// Read dimensions, georeferencing and nodata without decoding any pixels.
pub fn probe_geotiff<P: AsRef<Path>>(path: P) -> Result<RasterHeader> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path)?);
    let mut decoder = open_decoder(file, path)?;
    read_header(&mut decoder, path)
}

/// Read the `cols` x `rows` window at (`col_off`, `row_off`) from band 1.
///
/// Only the strips or tiles intersecting the window are decoded, so this
/// is cheap on large mosaics.
pub fn read_geotiff_window<T, P>(
    path: P,
    col_off: usize,
    row_off: usize,
    cols: usize,
    rows: usize,
) -> Result<Raster<T>>
where
    T: RasterElement,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = BufReader::new(File::open(path)?);
    let mut decoder = open_decoder(file, path)?;
    let header = read_header(&mut decoder, path)?;

    if cols == 0 || rows == 0 {
        return Err(Error::InvalidDimensions {
            width: cols,
            height: rows,
        });
    }
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

    let (chunk_w, chunk_h) = decoder.chunk_dimensions();
    let (chunk_w, chunk_h) = (chunk_w.max(1) as usize, chunk_h.max(1) as usize);
    let chunks_across = header.cols.div_ceil(chunk_w);

    let mut data = vec![T::default_nodata(); cols * rows];

    for cy in row_off / chunk_h..=(row_off + rows - 1) / chunk_h {
        for cx in col_off / chunk_w..=(col_off + cols - 1) / chunk_w {
            let index = (cy * chunks_across + cx) as u32;
            let (data_w, data_h) = decoder.chunk_data_dimensions(index);
            let chunk = decoder
                .read_chunk(index)
                .map_err(|e| Error::tiff(path, e))?;
            let samples = select_band(cast_samples::<T>(chunk)?, header.band_count, 1);

            let (x0, y0) = (cx * chunk_w, cy * chunk_h);
            for r in 0..data_h as usize {
                let gy = y0 + r;
                if gy < row_off || gy >= row_off + rows {
                    continue;
                }
                for c in 0..data_w as usize {
                    let gx = x0 + c;
                    if gx < col_off || gx >= col_off + cols {
                        continue;
                    }
                    data[(gy - row_off) * cols + (gx - col_off)] = samples[r * data_w as usize + c];
                }
            }
        }
    }

    let mut raster = Raster::from_vec(data, rows, cols)?;
    raster.set_transform(header.transform.window(col_off, row_off));
    apply_header(&mut raster, &header);
    Ok(raster)
}

fn open_decoder<R: Read + Seek>(reader: R, source: &Path) -> Result<Decoder<R>> {
    Ok(Decoder::new(reader)
        .map_err(|e| Error::tiff(source, e))?
        .with_limits(Limits::unlimited()))
}

/// Internal: decode a GeoTIFF from any `Read + Seek` source
fn decode_geotiff<T, R>(reader: R, band: Option<usize>, source: &Path) -> Result<Raster<T>>
where
    T: RasterElement,
    R: Read + Seek,
{
    let mut decoder = open_decoder(reader, source)?;
    let header = read_header(&mut decoder, source)?;

    let band = band.unwrap_or(1);
    if band == 0 || band > header.band_count {
        return Err(Error::InvalidParameter {
            name: "band",
            value: band.to_string(),
            reason: format!("file has {} band(s)", header.band_count),
        });
    }

    let result = decoder
        .read_image()
        .map_err(|e| Error::tiff(source, e))?;
    let data = select_band(cast_samples::<T>(result)?, header.band_count, band);

    if data.len() != header.rows * header.cols {
        return Err(Error::InvalidDimensions {
            width: header.cols,
            height: header.rows,
        });
    }

    let mut raster = Raster::from_vec(data, header.rows, header.cols)?;
    raster.set_transform(header.transform);
    apply_header(&mut raster, &header);
    Ok(raster)
}

fn apply_header<T: RasterElement>(raster: &mut Raster<T>, header: &RasterHeader) {
    raster.set_crs(header.crs.clone());
    raster.set_nodata(header.nodata.and_then(num_traits::cast));
}

fn cast_samples<T: RasterElement>(result: DecodingResult) -> Result<Vec<T>> {
    macro_rules! cast_all {
        ($buf:expr) => {
            $buf.into_iter()
                .map(|v| num_traits::cast(v).unwrap_or_else(T::default_nodata))
                .collect()
        };
    }

    Ok(match result {
        DecodingResult::U8(buf) => cast_all!(buf),
        DecodingResult::U16(buf) => cast_all!(buf),
        DecodingResult::U32(buf) => cast_all!(buf),
        DecodingResult::U64(buf) => cast_all!(buf),
        DecodingResult::I8(buf) => cast_all!(buf),
        DecodingResult::I16(buf) => cast_all!(buf),
        DecodingResult::I32(buf) => cast_all!(buf),
        DecodingResult::I64(buf) => cast_all!(buf),
        DecodingResult::F32(buf) => cast_all!(buf),
        DecodingResult::F64(buf) => cast_all!(buf),
    })
}

/// Pick band `band` (1-indexed) out of pixel-interleaved samples
fn select_band<T: Copy>(samples: Vec<T>, band_count: usize, band: usize) -> Vec<T> {
    if band_count <= 1 {
        return samples;
    }
    samples
        .into_iter()
        .skip(band - 1)
        .step_by(band_count)
        .collect()
}

fn read_header<R: Read + Seek>(decoder: &mut Decoder<R>, source: &Path) -> Result<RasterHeader> {
    let (width, height) = decoder
        .dimensions()
        .map_err(|e| Error::tiff(source, e))?;

    let band_count = decoder
        .find_tag_unsigned::<u16>(Tag::SamplesPerPixel)
        .ok()
        .flatten()
        .unwrap_or(1)
        .max(1) as usize;

    let transform = read_geotransform(decoder).unwrap_or_else(|| {
        debug!(source = %source.display(), "no georeferencing tags, using identity transform");
        GeoTransform::default()
    });

    Ok(RasterHeader {
        rows: height as usize,
        cols: width as usize,
        band_count,
        transform,
        crs: read_crs(decoder),
        nodata: read_nodata(decoder),
    })
}

/// GeoTransform from pixel scale + tiepoint, or from a model transformation
fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok();
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok();

    if let (Some(scale), Some(tiepoint)) = (scale, tiepoint) {
        if scale.len() >= 2 && tiepoint.len() >= 6 {
            // tiepoint: [I, J, K, X, Y, Z], scale: [ScaleX, ScaleY, ScaleZ]
            let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
            let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
            return Some(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]));
        }
    }

    let matrix = decoder.get_tag_f64_vec(Tag::ModelTransformationTag).ok()?;
    if matrix.len() < 8 {
        return None;
    }
    Some(GeoTransform {
        origin_x: matrix[3],
        pixel_width: matrix[0],
        row_rotation: matrix[1],
        origin_y: matrix[7],
        col_rotation: matrix[4],
        pixel_height: matrix[5],
    })
}

fn read_crs<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<CRS> {
    let keys = decoder.get_tag_u16_vec(Tag::GeoKeyDirectoryTag).ok()?;
    if keys.len() < 4 {
        return None;
    }

    let mut model_type = None;
    let mut projected = None;
    let mut geographic = None;

    // Header is 4 shorts, then one (id, location, count, value) entry per key
    for entry in keys[4..].chunks_exact(4) {
        // location != 0 means the value lives in another tag
        if entry[1] != 0 {
            continue;
        }
        match entry[0] {
            GT_MODEL_TYPE => model_type = Some(entry[3]),
            PROJECTED_CS_TYPE => projected = Some(entry[3]),
            GEOGRAPHIC_TYPE => geographic = Some(entry[3]),
            _ => {}
        }
    }

    let code = match model_type {
        Some(MODEL_TYPE_GEOGRAPHIC) => geographic,
        _ => projected.or(geographic),
    }?;

    (code != USER_DEFINED).then(|| CRS::from_epsg(code as u32))
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder.get_tag_ascii_string(Tag::GdalNodata).ok()?;
    text.trim_matches(char::from(0)).trim().parse().ok()
}

/// Write a Raster to a GeoTIFF file
///
/// Always writes a single Float32 band.
pub fn write_geotiff<T, P>(
    raster: &Raster<T>,
    path: P,
    options: Option<GeoTiffOptions>,
) -> Result<()>
where
    T: RasterElement,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let options = options.unwrap_or_default();
    let mut writer = BufWriter::new(File::create(path)?);
    encode_geotiff(raster, &mut writer, &options, path)?;
    writer.flush()?;

    debug!(
        path = %path.display(),
        rows = raster.rows(),
        cols = raster.cols(),
        compression = %options.compression,
        "wrote GeoTIFF"
    );
    Ok(())
}

/// Write a Raster to an in-memory GeoTIFF buffer
pub fn write_geotiff_to_buffer<T>(
    raster: &Raster<T>,
    options: Option<GeoTiffOptions>,
) -> Result<Vec<u8>>
where
    T: RasterElement,
{
    let mut buf = Vec::new();
    encode_geotiff(
        raster,
        Cursor::new(&mut buf),
        &options.unwrap_or_default(),
        buffer_label(),
    )?;
    Ok(buf)
}

fn deflate_level(level: u32) -> DeflateLevel {
    match level {
        0..=3 => DeflateLevel::Fast,
        4..=6 => DeflateLevel::Balanced,
        _ => DeflateLevel::Best,
    }
}

/// Internal: encode a Raster as GeoTIFF into any `Write + Seek` sink
fn encode_geotiff<T, W>(
    raster: &Raster<T>,
    writer: W,
    options: &GeoTiffOptions,
    target: &Path,
) -> Result<()>
where
    T: RasterElement,
    W: Write + Seek,
{
    let (rows, cols) = raster.shape();
    if rows == 0 || cols == 0 {
        return Err(Error::InvalidDimensions {
            width: cols,
            height: rows,
        });
    }

    let mut encoder = TiffEncoder::new(writer).map_err(|e| Error::tiff(target, e))?;

    let data: Vec<f32> = raster
        .data()
        .iter()
        .map(|&v| num_traits::cast(v).unwrap_or(f32::NAN))
        .collect();

    match options.compression.to_ascii_uppercase().as_str() {
        "LZW" => write_band(&mut encoder, raster, &data, options, Lzw, target),
        "DEFLATE" => write_band(
            &mut encoder,
            raster,
            &data,
            options,
            Deflate::with_level(deflate_level(options.level)),
            target,
        ),
        "NONE" | "" => write_band(&mut encoder, raster, &data, options, Uncompressed, target),
        other => Err(Error::InvalidParameter {
            name: "compression",
            value: other.to_string(),
            reason: "expected LZW, DEFLATE or NONE".to_string(),
        }),
    }
}

fn write_band<T, W, D>(
    encoder: &mut TiffEncoder<W>,
    raster: &Raster<T>,
    data: &[f32],
    options: &GeoTiffOptions,
    compression: D,
    target: &Path,
) -> Result<()>
where
    T: RasterElement,
    W: Write + Seek,
    D: Compression,
{
    let (rows, cols) = raster.shape();
    let mut image = encoder
        .new_image_with_compression::<Gray32Float, D>(cols as u32, rows as u32, compression)
        .map_err(|e| Error::tiff(target, e))?;

    let strip_rows = options.tile_size.clamp(1, rows) as u32;
    image
        .rows_per_strip(strip_rows)
        .map_err(|e| Error::tiff(target, e))?;

    let gt = raster.transform();
    let scale = [gt.pixel_width, gt.pixel_height.abs(), 0.0];
    let tiepoint = [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0];
    let geokeys = geokey_directory(raster.crs());

    let dir = image.encoder();
    dir.write_tag(Tag::ModelPixelScaleTag, &scale[..])
        .map_err(|e| Error::tiff(target, e))?;
    dir.write_tag(Tag::ModelTiepointTag, &tiepoint[..])
        .map_err(|e| Error::tiff(target, e))?;
    dir.write_tag(Tag::GeoKeyDirectoryTag, geokeys.as_slice())
        .map_err(|e| Error::tiff(target, e))?;

    if let Some(nodata) = raster.nodata().and_then(|v| v.to_f64()) {
        let text = format!("{}", nodata);
        dir.write_tag(Tag::GdalNodata, text.as_str())
            .map_err(|e| Error::tiff(target, e))?;
    }

    image
        .write_data(data)
        .map_err(|e| Error::tiff(target, e))?;

    Ok(())
}

/// GeoKey directory with model type, raster type and (when known) the EPSG code
fn geokey_directory(crs: Option<&CRS>) -> Vec<u16> {
    let epsg = crs.and_then(|c| {
        let code = u16::try_from(c.epsg()?).ok()?;
        Some((c.is_geographic(), code))
    });

    let mut entries: Vec<[u16; 4]> = Vec::with_capacity(3);
    match epsg {
        Some((true, code)) => {
            entries.push([GT_MODEL_TYPE, 0, 1, MODEL_TYPE_GEOGRAPHIC]);
            entries.push([GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA]);
            entries.push([GEOGRAPHIC_TYPE, 0, 1, code]);
        }
        Some((false, code)) => {
            entries.push([GT_MODEL_TYPE, 0, 1, MODEL_TYPE_PROJECTED]);
            entries.push([GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA]);
            entries.push([PROJECTED_CS_TYPE, 0, 1, code]);
        }
        None => {
            entries.push([GT_MODEL_TYPE, 0, 1, MODEL_TYPE_PROJECTED]);
            entries.push([GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA]);
        }
    }

    let mut keys = vec![1, 1, 0, entries.len() as u16];
    keys.extend(entries.into_iter().flatten());
    keys
}
