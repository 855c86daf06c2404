//! Chunk decoding: decompression, predictor reversal and sample conversion.

use super::tiff::Endian;
use crate::error::{CloudError, Result};

/// TIFF compression codes
pub mod compression {
    pub const NONE: u16 = 1;
    pub const LZW: u16 = 5;
    pub const DEFLATE: u16 = 8;
    pub const ADOBE_DEFLATE: u16 = 32946;
}

/// TIFF sample format codes
pub mod sample_format {
    pub const UINT: u16 = 1;
    pub const INT: u16 = 2;
    pub const FLOAT: u16 = 3;
}

/// How the samples of one chunk are laid out
#[derive(Debug, Clone, Copy)]
pub struct SampleLayout {
    pub endian: Endian,
    pub bits_per_sample: u16,
    pub sample_format: u16,
    pub compression: u16,
    pub predictor: u16,
    /// Samples per chunk row
    pub row_len: usize,
}

impl SampleLayout {
    fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }
}

/// Decode one compressed chunk into f64 samples (row-major).
pub fn decode_chunk(data: &[u8], layout: &SampleLayout) -> Result<Vec<f64>> {
    let mut raw = decompress(data, layout.compression)?;
    match layout.predictor {
        1 => {}
        2 => undo_horizontal_predictor(&mut raw, layout)?,
        p => return Err(CloudError::UnsupportedPredictor(p)),
    }
    to_samples(&raw, layout)
}

fn decompress(data: &[u8], code: u16) -> Result<Vec<u8>> {
    match code {
        compression::NONE => Ok(data.to_vec()),

        #[cfg(feature = "deflate")]
        compression::DEFLATE | compression::ADOBE_DEFLATE => {
            use std::io::Read;
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .or_else(|_| {
                    out.clear();
                    flate2::read::DeflateDecoder::new(data).read_to_end(&mut out)
                })
                .map_err(|e| CloudError::Decompress(format!("DEFLATE: {}", e)))?;
            Ok(out)
        }

        #[cfg(feature = "lzw")]
        compression::LZW => weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
            .decode(data)
            .map_err(|e| CloudError::Decompress(format!("LZW: {}", e))),

        other => Err(CloudError::UnsupportedCompression(other)),
    }
}

/// Reverse horizontal differencing (predictor 2) on integer samples.
fn undo_horizontal_predictor(raw: &mut [u8], layout: &SampleLayout) -> Result<()> {
    if layout.sample_format == sample_format::FLOAT {
        return Err(CloudError::UnsupportedPredictor(2));
    }
    let size = layout.bytes_per_sample();
    let row_bytes = layout.row_len * size;
    if row_bytes == 0 {
        return Ok(());
    }

    for row in raw.chunks_mut(row_bytes) {
        match size {
            1 => {
                for i in 1..row.len() {
                    row[i] = row[i].wrapping_add(row[i - 1]);
                }
            }
            2 => {
                let mut prev = 0u16;
                for b in row.chunks_exact_mut(2) {
                    let v = layout.endian.u16(b).wrapping_add(prev);
                    write_u16(layout.endian, b, v);
                    prev = v;
                }
            }
            4 => {
                let mut prev = 0u32;
                for b in row.chunks_exact_mut(4) {
                    let v = layout.endian.u32(b).wrapping_add(prev);
                    write_u32(layout.endian, b, v);
                    prev = v;
                }
            }
            _ => return Err(CloudError::UnsupportedPredictor(2)),
        }
    }
    Ok(())
}

fn write_u16(endian: Endian, b: &mut [u8], v: u16) {
    b.copy_from_slice(&match endian {
        Endian::Little => v.to_le_bytes(),
        Endian::Big => v.to_be_bytes(),
    });
}

fn write_u32(endian: Endian, b: &mut [u8], v: u32) {
    b.copy_from_slice(&match endian {
        Endian::Little => v.to_le_bytes(),
        Endian::Big => v.to_be_bytes(),
    });
}

fn to_samples(raw: &[u8], layout: &SampleLayout) -> Result<Vec<f64>> {
    let e = layout.endian;
    let (bps, sf) = (layout.bits_per_sample, layout.sample_format);
    let values = match (bps, sf) {
        (8, sample_format::UINT) => raw.iter().map(|&b| b as f64).collect(),
        (8, sample_format::INT) => raw.iter().map(|&b| b as i8 as f64).collect(),
        (16, sample_format::UINT) => raw.chunks_exact(2).map(|b| e.u16(b) as f64).collect(),
        (16, sample_format::INT) => raw.chunks_exact(2).map(|b| e.u16(b) as i16 as f64).collect(),
        (32, sample_format::UINT) => raw.chunks_exact(4).map(|b| e.u32(b) as f64).collect(),
        (32, sample_format::INT) => raw.chunks_exact(4).map(|b| e.u32(b) as i32 as f64).collect(),
        (32, sample_format::FLOAT) => raw.chunks_exact(4).map(|b| e.f32(b) as f64).collect(),
        (64, sample_format::FLOAT) => raw.chunks_exact(8).map(|b| e.f64(b)).collect(),
        _ => return Err(CloudError::UnsupportedDataType { bps, sf }),
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(bps: u16, sf: u16, predictor: u16, row_len: usize) -> SampleLayout {
        SampleLayout {
            endian: Endian::Little,
            bits_per_sample: bps,
            sample_format: sf,
            compression: compression::NONE,
            predictor,
            row_len,
        }
    }

    #[test]
    fn test_uncompressed_u16() {
        let raw: Vec<u8> = [100u16, 200, 300].iter().flat_map(|v| v.to_le_bytes()).collect();
        let out = decode_chunk(&raw, &layout(16, sample_format::UINT, 1, 3)).unwrap();
        assert_eq!(out, vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn test_horizontal_predictor_per_row() {
        // Rows [5, 7, 10] and [1, 1, 4] stored as differences
        let diffs: Vec<u8> = [5u16, 2, 3, 1, 0, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let out = decode_chunk(&diffs, &layout(16, sample_format::UINT, 2, 3)).unwrap();
        assert_eq!(out, vec![5.0, 7.0, 10.0, 1.0, 1.0, 4.0]);
    }

    #[test]
    fn test_float_predictor_rejected() {
        let raw = vec![0u8; 8];
        assert!(decode_chunk(&raw, &layout(32, sample_format::FLOAT, 3, 2)).is_err());
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn test_deflate_f32() {
        use std::io::Write;
        let raw: Vec<u8> = [0.25f32, -0.5].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&raw).unwrap();
        let compressed = enc.finish().unwrap();

        let mut l = layout(32, sample_format::FLOAT, 1, 2);
        l.compression = compression::DEFLATE;
        assert_eq!(decode_chunk(&compressed, &l).unwrap(), vec![0.25, -0.5]);
    }
}
