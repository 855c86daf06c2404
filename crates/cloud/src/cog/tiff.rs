//! Minimal TIFF structure parsing for range-read GeoTIFFs.
//!
//! Works on byte slices fetched by range, without `Read + Seek`. Only
//! classic TIFF (magic 42) is handled; BigTIFF is rejected.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use ndvisync_core::{GeoTransform, CRS};
use std::collections::HashMap;

use crate::error::{CloudError, Result};

/// Tag ids this reader cares about
pub mod tags {
    pub const IMAGE_WIDTH: u16 = 256;
    pub const IMAGE_LENGTH: u16 = 257;
    pub const BITS_PER_SAMPLE: u16 = 258;
    pub const COMPRESSION: u16 = 259;
    pub const STRIP_OFFSETS: u16 = 273;
    pub const SAMPLES_PER_PIXEL: u16 = 277;
    pub const ROWS_PER_STRIP: u16 = 278;
    pub const STRIP_BYTE_COUNTS: u16 = 279;
    pub const PLANAR_CONFIG: u16 = 284;
    pub const PREDICTOR: u16 = 317;
    pub const TILE_WIDTH: u16 = 322;
    pub const TILE_LENGTH: u16 = 323;
    pub const TILE_OFFSETS: u16 = 324;
    pub const TILE_BYTE_COUNTS: u16 = 325;
    pub const SAMPLE_FORMAT: u16 = 339;
    pub const MODEL_PIXEL_SCALE: u16 = 33550;
    pub const MODEL_TIEPOINT: u16 = 33922;
    pub const MODEL_TRANSFORMATION: u16 = 34264;
    pub const GEO_KEY_DIRECTORY: u16 = 34735;
    pub const GDAL_NODATA: u16 = 42113;

    /// Tags whose values are resolved when an IFD is opened
    pub const RESOLVED: [u16; 20] = [
        IMAGE_WIDTH,
        IMAGE_LENGTH,
        BITS_PER_SAMPLE,
        COMPRESSION,
        STRIP_OFFSETS,
        SAMPLES_PER_PIXEL,
        ROWS_PER_STRIP,
        STRIP_BYTE_COUNTS,
        PLANAR_CONFIG,
        PREDICTOR,
        TILE_WIDTH,
        TILE_LENGTH,
        TILE_OFFSETS,
        TILE_BYTE_COUNTS,
        SAMPLE_FORMAT,
        MODEL_PIXEL_SCALE,
        MODEL_TIEPOINT,
        MODEL_TRANSFORMATION,
        GEO_KEY_DIRECTORY,
        GDAL_NODATA,
    ];
}

/// Byte order declared in the TIFF header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn u16(self, b: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(b),
            Endian::Big => BigEndian::read_u16(b),
        }
    }

    pub fn u32(self, b: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        }
    }

    pub fn u64(self, b: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(b),
            Endian::Big => BigEndian::read_u64(b),
        }
    }

    pub fn f32(self, b: &[u8]) -> f32 {
        match self {
            Endian::Little => LittleEndian::read_f32(b),
            Endian::Big => BigEndian::read_f32(b),
        }
    }

    pub fn f64(self, b: &[u8]) -> f64 {
        match self {
            Endian::Little => LittleEndian::read_f64(b),
            Endian::Big => BigEndian::read_f64(b),
        }
    }
}

fn invalid(reason: impl Into<String>) -> CloudError {
    CloudError::InvalidTiff {
        reason: reason.into(),
    }
}

/// Parse the 8-byte header into (byte order, first IFD offset).
pub fn parse_header(data: &[u8]) -> Result<(Endian, u64)> {
    if data.len() < 8 {
        return Err(invalid("header too short"));
    }
    let endian = match &data[0..2] {
        b"II" => Endian::Little,
        b"MM" => Endian::Big,
        _ => return Err(invalid("bad byte order marker")),
    };
    match endian.u16(&data[2..4]) {
        42 => Ok((endian, endian.u32(&data[4..8]) as u64)),
        43 => Err(invalid("BigTIFF is not supported")),
        magic => Err(invalid(format!("bad magic number {}", magic))),
    }
}

/// One 12-byte directory entry
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub tag: u16,
    pub field_type: u16,
    pub count: u32,
    raw: [u8; 4],
}

impl Entry {
    fn type_size(&self) -> u64 {
        match self.field_type {
            1 | 2 | 6 | 7 => 1,
            3 | 8 => 2,
            4 | 9 | 11 => 4,
            5 | 10 | 12 | 16 => 8,
            _ => 1,
        }
    }

    /// Size of the value in bytes
    pub fn byte_len(&self) -> u64 {
        self.type_size() * self.count as u64
    }

    /// Values of at most four bytes are stored in the entry itself
    pub fn is_inline(&self) -> bool {
        self.byte_len() <= 4
    }

    pub fn value_offset(&self, endian: Endian) -> u64 {
        endian.u32(&self.raw) as u64
    }

    pub fn inline_bytes(&self) -> &[u8] {
        &self.raw[..self.byte_len().min(4) as usize]
    }
}

/// Byte length of a directory with `entry_count` entries, including the
/// count field and the next-IFD pointer.
pub fn ifd_len(entry_count: usize) -> usize {
    2 + entry_count * 12 + 4
}

/// Parse the directory starting at the beginning of `data`.
pub fn parse_entries(endian: Endian, data: &[u8]) -> Result<Vec<Entry>> {
    if data.len() < 2 {
        return Err(invalid("IFD truncated"));
    }
    let count = endian.u16(&data[0..2]) as usize;
    if data.len() < ifd_len(count) {
        return Err(invalid(format!(
            "IFD with {} entries needs {} bytes, have {}",
            count,
            ifd_len(count),
            data.len()
        )));
    }

    Ok((0..count)
        .map(|i| {
            let e = &data[2 + i * 12..2 + (i + 1) * 12];
            Entry {
                tag: endian.u16(&e[0..2]),
                field_type: endian.u16(&e[2..4]),
                count: endian.u32(&e[4..8]),
                raw: [e[8], e[9], e[10], e[11]],
            }
        })
        .collect())
}

/// A directory whose interesting tag values have been loaded.
#[derive(Debug, Clone)]
pub struct Directory {
    endian: Endian,
    entries: HashMap<u16, Entry>,
    values: HashMap<u16, Vec<u8>>,
}

impl Directory {
    /// `values` holds the raw bytes of every out-of-line value that was
    /// fetched; inline values are read from the entries.
    pub fn new(endian: Endian, entries: Vec<Entry>, values: HashMap<u16, Vec<u8>>) -> Self {
        Self {
            endian,
            entries: entries.into_iter().map(|e| (e.tag, e)).collect(),
            values,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    fn bytes(&self, tag: u16) -> Option<(&Entry, &[u8])> {
        let entry = self.entries.get(&tag)?;
        if entry.is_inline() {
            Some((entry, entry.inline_bytes()))
        } else {
            Some((entry, self.values.get(&tag)?.as_slice()))
        }
    }

    /// Integer values of a BYTE/SHORT/LONG/LONG8 tag
    pub fn uints(&self, tag: u16) -> Option<Vec<u64>> {
        let (entry, data) = self.bytes(tag)?;
        let size = entry.type_size() as usize;
        let read: fn(Endian, &[u8]) -> u64 = match entry.field_type {
            1 => |_, b| b[0] as u64,
            3 => |e, b| e.u16(b) as u64,
            4 => |e, b| e.u32(b) as u64,
            16 => |e, b| e.u64(b),
            _ => return None,
        };
        Some(
            data.chunks_exact(size)
                .take(entry.count as usize)
                .map(|b| read(self.endian, b))
                .collect(),
        )
    }

    pub fn uint(&self, tag: u16) -> Option<u64> {
        self.uints(tag)?.first().copied()
    }

    /// Values of a FLOAT/DOUBLE tag
    pub fn floats(&self, tag: u16) -> Option<Vec<f64>> {
        let (entry, data) = self.bytes(tag)?;
        let values: Vec<f64> = match entry.field_type {
            11 => data.chunks_exact(4).map(|b| self.endian.f32(b) as f64).collect(),
            12 => data.chunks_exact(8).map(|b| self.endian.f64(b)).collect(),
            _ => return None,
        };
        Some(values)
    }

    /// NUL-terminated ASCII value
    pub fn ascii(&self, tag: u16) -> Option<String> {
        let (entry, data) = self.bytes(tag)?;
        if entry.field_type != 2 {
            return None;
        }
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Some(String::from_utf8_lossy(&data[..end]).trim().to_string())
    }

    // -----------------------------------------------------------------------
    // GeoTIFF
    // -----------------------------------------------------------------------

    /// Geotransform from pixel scale + tiepoint, or the 4x4 model
    /// transformation matrix.
    pub fn geo_transform(&self) -> Option<GeoTransform> {
        if let (Some(scale), Some(tie)) = (
            self.floats(tags::MODEL_PIXEL_SCALE),
            self.floats(tags::MODEL_TIEPOINT),
        ) {
            if scale.len() >= 2 && tie.len() >= 6 {
                return Some(GeoTransform::new(
                    tie[3] - tie[0] * scale[0],
                    tie[4] + tie[1] * scale[1],
                    scale[0],
                    -scale[1],
                ));
            }
        }
        let m = self.floats(tags::MODEL_TRANSFORMATION)?;
        (m.len() >= 16).then(|| GeoTransform {
            origin_x: m[3],
            origin_y: m[7],
            pixel_width: m[0],
            pixel_height: m[5],
            row_rotation: m[1],
            col_rotation: m[4],
        })
    }

    /// EPSG code from ProjectedCSType (3072) or GeographicType (2048)
    pub fn crs(&self) -> Option<CRS> {
        let keys = self.uints(tags::GEO_KEY_DIRECTORY)?;
        let count = *keys.get(3)? as usize;
        let mut geographic = None;
        for key in keys[4..].chunks_exact(4).take(count) {
            // Location 0 means the value is stored in the key itself
            if key[1] != 0 || key[3] == 0 || key[3] == 32767 {
                continue;
            }
            match key[0] {
                3072 => return Some(CRS::from_epsg(key[3] as u32)),
                2048 => geographic = Some(CRS::from_epsg(key[3] as u32)),
                _ => {}
            }
        }
        geographic
    }

    pub fn nodata(&self) -> Option<f64> {
        self.ascii(tags::GDAL_NODATA)?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_bytes(tag: u16, field_type: u16, count: u32, value: [u8; 4]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&tag.to_le_bytes());
        v.extend_from_slice(&field_type.to_le_bytes());
        v.extend_from_slice(&count.to_le_bytes());
        v.extend_from_slice(&value);
        v
    }

    #[test]
    fn test_header() {
        assert_eq!(parse_header(b"II*\0\x08\0\0\0").unwrap(), (Endian::Little, 8));
        assert_eq!(parse_header(b"MM\0*\0\0\0\x10").unwrap(), (Endian::Big, 16));
        assert!(parse_header(b"II+\0\x08\0\0\0").is_err());
        assert!(parse_header(b"XX*\0").is_err());
    }

    #[test]
    fn test_inline_and_external_values() {
        let mut data = 2u16.to_le_bytes().to_vec();
        data.extend(entry_bytes(tags::IMAGE_WIDTH, 3, 1, [0, 2, 0, 0]));
        data.extend(entry_bytes(tags::MODEL_PIXEL_SCALE, 12, 3, [64, 0, 0, 0]));
        data.extend(0u32.to_le_bytes());

        let entries = parse_entries(Endian::Little, &data).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_inline());
        assert!(!entries[1].is_inline());
        assert_eq!(entries[1].value_offset(Endian::Little), 64);

        let scale: Vec<u8> = [10.0f64, 10.0, 0.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let dir = Directory::new(
            Endian::Little,
            entries,
            HashMap::from([(tags::MODEL_PIXEL_SCALE, scale)]),
        );
        assert_eq!(dir.uint(tags::IMAGE_WIDTH), Some(512));
        assert_eq!(dir.floats(tags::MODEL_PIXEL_SCALE), Some(vec![10.0, 10.0, 0.0]));
        assert_eq!(dir.uint(tags::TILE_WIDTH), None);
    }

    #[test]
    fn test_truncated_ifd() {
        let mut data = 3u16.to_le_bytes().to_vec();
        data.extend(entry_bytes(tags::IMAGE_WIDTH, 3, 1, [1, 0, 0, 0]));
        assert!(parse_entries(Endian::Little, &data).is_err());
    }
}
