//! Window reads over a [`RangeSource`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use ndarray::Array2;
use ndvisync_core::{GeoTransform, Raster, CRS};
use tracing::debug;

use super::cache::ChunkCache;
use super::decode::{decode_chunk, SampleLayout};
use super::tiff::{self, tags, Directory};
use super::RangeSource;
use crate::bbox::{pixel_window, BBox};
use crate::error::{CloudError, Result};

/// Options for [`CogReader`]
#[derive(Debug, Clone)]
pub struct CogReaderOptions {
    /// Maximum number of chunk requests in flight (default 8)
    pub max_concurrent_fetches: usize,
    /// Decoded chunks kept in the LRU cache (default 128)
    pub cache_capacity: usize,
    /// Bytes fetched up front for the header and first IFD (default 64 KiB)
    pub prefetch_bytes: u64,
}

impl Default for CogReaderOptions {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            cache_capacity: 128,
            prefetch_bytes: 64 * 1024,
        }
    }
}

/// Layout and georeferencing of the full-resolution image
#[derive(Debug, Clone)]
pub struct CogMetadata {
    pub width: usize,
    pub height: usize,
    pub chunk_width: usize,
    pub chunk_height: usize,
    pub tiled: bool,
    pub bits_per_sample: u16,
    pub sample_format: u16,
    pub compression: u16,
    pub geo_transform: GeoTransform,
    pub crs: Option<CRS>,
    pub nodata: Option<f64>,
}

/// Reader for the first image of a GeoTIFF.
pub struct CogReader<S: RangeSource> {
    source: S,
    meta: CogMetadata,
    layout: SampleLayout,
    offsets: Vec<u64>,
    byte_counts: Vec<u64>,
    cache: ChunkCache,
    options: CogReaderOptions,
}

/// Slice `[offset, offset + len)` out of the prefetched bytes, or fetch it.
async fn slice_or_fetch<S: RangeSource>(source: &S, prefix: &[u8], offset: u64, len: u64) -> Result<Vec<u8>> {
    let end = offset.saturating_add(len);
    if end <= prefix.len() as u64 {
        Ok(prefix[offset as usize..end as usize].to_vec())
    } else {
        source.read_range(offset, len).await
    }
}

impl<S: RangeSource> CogReader<S> {
    /// Read the header and first IFD.
    pub async fn open(source: S, options: CogReaderOptions) -> Result<Self> {
        let size = source.size().await?;
        let prefetch = size.map_or(options.prefetch_bytes, |s| s.min(options.prefetch_bytes));
        let prefix = source.read_range(0, prefetch).await?;

        let (endian, ifd_offset) = tiff::parse_header(&prefix)?;
        if ifd_offset == 0 {
            return Err(CloudError::NoIfd);
        }
        let count_bytes = slice_or_fetch(&source, &prefix, ifd_offset, 2).await?;
        if count_bytes.len() < 2 {
            return Err(CloudError::NoIfd);
        }
        let entry_count = endian.u16(&count_bytes) as usize;
        let ifd_bytes =
            slice_or_fetch(&source, &prefix, ifd_offset, tiff::ifd_len(entry_count) as u64).await?;
        let entries = tiff::parse_entries(endian, &ifd_bytes)?;

        let mut values = HashMap::new();
        for entry in entries.iter().filter(|e| !e.is_inline() && tags::RESOLVED.contains(&e.tag)) {
            let bytes =
                slice_or_fetch(&source, &prefix, entry.value_offset(endian), entry.byte_len()).await?;
            values.insert(entry.tag, bytes);
        }
        let dir = Directory::new(endian, entries, values);

        let (meta, offsets, byte_counts, predictor) = describe(&dir)?;
        let layout = SampleLayout {
            endian,
            bits_per_sample: meta.bits_per_sample,
            sample_format: meta.sample_format,
            compression: meta.compression,
            predictor,
            row_len: meta.chunk_width,
        };

        debug!(
            width = meta.width,
            height = meta.height,
            chunk_width = meta.chunk_width,
            chunk_height = meta.chunk_height,
            tiled = meta.tiled,
            "opened GeoTIFF"
        );

        Ok(Self {
            source,
            cache: ChunkCache::new(options.cache_capacity),
            meta,
            layout,
            offsets,
            byte_counts,
            options,
        })
    }

    pub fn metadata(&self) -> &CogMetadata {
        &self.meta
    }

    /// Read the pixels intersecting `bbox` (in the file's CRS).
    pub async fn read_bbox(&mut self, bbox: &BBox) -> Result<Raster<f64>> {
        let (col_min, row_min, col_max, row_max) =
            pixel_window(bbox, &self.meta.geo_transform, self.meta.width, self.meta.height)
                .ok_or(CloudError::BBoxOutside)?;
        self.read_window(col_min, row_min, col_max - col_min, row_max - row_min)
            .await
    }

    /// Read a `cols x rows` pixel window at (`col_off`, `row_off`).
    pub async fn read_window(
        &mut self,
        col_off: usize,
        row_off: usize,
        cols: usize,
        rows: usize,
    ) -> Result<Raster<f64>> {
        let (width, height) = (self.meta.width, self.meta.height);
        if cols == 0 || rows == 0 || col_off + cols > width || row_off + rows > height {
            return Err(ndvisync_core::Error::WindowOutOfBounds {
                col_off,
                row_off,
                cols,
                rows,
                raster_rows: height,
                raster_cols: width,
            }
            .into());
        }

        let (cw, ch) = (self.meta.chunk_width, self.meta.chunk_height);
        let across = width.div_ceil(cw);
        let chunks: Vec<(usize, usize)> = (row_off / ch..=(row_off + rows - 1) / ch)
            .flat_map(|cy| (col_off / cw..=(col_off + cols - 1) / cw).map(move |cx| (cx, cy)))
            .collect();

        let indices: Vec<usize> = chunks.iter().map(|&(cx, cy)| cy * across + cx).collect();
        let loaded = self.load_chunks(&indices).await?;

        let fill = self.meta.nodata.unwrap_or(f64::NAN);
        let mut out = Array2::from_elem((rows, cols), fill);

        for (&(cx, cy), index) in chunks.iter().zip(&indices) {
            let Some(samples) = loaded.get(index) else {
                continue;
            };
            let (x0, y0) = (cx * cw, cy * ch);
            for r in 0..ch {
                let gy = y0 + r;
                if gy < row_off || gy >= row_off + rows {
                    continue;
                }
                for c in 0..cw {
                    let gx = x0 + c;
                    if gx < col_off || gx >= col_off + cols {
                        continue;
                    }
                    if let Some(&v) = samples.get(r * cw + c) {
                        out[(gy - row_off, gx - col_off)] = v;
                    }
                }
            }
        }

        let mut raster = Raster::from_array(out);
        raster.set_transform(self.meta.geo_transform.window(col_off, row_off));
        raster.set_crs(self.meta.crs.clone());
        raster.set_nodata(self.meta.nodata);
        Ok(raster)
    }

    /// Decoded samples for every listed chunk, from the cache or fetched
    /// in batches of `max_concurrent_fetches`.
    async fn load_chunks(&mut self, indices: &[usize]) -> Result<HashMap<usize, Arc<Vec<f64>>>> {
        let mut loaded = HashMap::with_capacity(indices.len());
        let mut missing = Vec::new();
        for &index in indices {
            match self.cache.get(index) {
                Some(samples) => {
                    loaded.insert(index, samples);
                }
                None => missing.push(index),
            }
        }

        for batch in missing.chunks(self.options.max_concurrent_fetches.max(1)) {
            let decoded = try_join_all(batch.iter().map(|&index| {
                let (source, layout) = (&self.source, &self.layout);
                let offset = self.offsets.get(index).copied();
                let length = self.byte_counts.get(index).copied();
                async move {
                    let samples = match (offset, length) {
                        (Some(offset), Some(length)) if length > 0 => {
                            let data = source.read_range(offset, length).await?;
                            decode_chunk(&data, layout)?
                        }
                        // Sparse chunk: every pixel is nodata
                        _ => Vec::new(),
                    };
                    Ok::<_, CloudError>((index, samples))
                }
            }))
            .await?;

            for (index, samples) in decoded {
                let samples = Arc::new(samples);
                self.cache.insert(index, samples.clone());
                loaded.insert(index, samples);
            }
        }

        debug!(chunks = indices.len(), fetched = missing.len(), "chunks loaded");
        Ok(loaded)
    }
}

type Description = (CogMetadata, Vec<u64>, Vec<u64>, u16);

fn describe(dir: &Directory) -> Result<Description> {
    let invalid = |reason: &str| CloudError::InvalidTiff {
        reason: reason.to_string(),
    };

    let width = dir.uint(tags::IMAGE_WIDTH).ok_or_else(|| invalid("missing ImageWidth"))? as usize;
    let height = dir.uint(tags::IMAGE_LENGTH).ok_or_else(|| invalid("missing ImageLength"))? as usize;
    if width == 0 || height == 0 {
        return Err(invalid("empty image"));
    }

    let samples = dir.uint(tags::SAMPLES_PER_PIXEL).unwrap_or(1);
    if samples != 1 {
        return Err(CloudError::UnsupportedLayout(format!(
            "{} samples per pixel (single band only)",
            samples
        )));
    }

    let tiled = dir.uint(tags::TILE_WIDTH).is_some();
    let (chunk_width, chunk_height, offsets, byte_counts) = if tiled {
        (
            dir.uint(tags::TILE_WIDTH).unwrap_or(0) as usize,
            dir.uint(tags::TILE_LENGTH).ok_or_else(|| invalid("missing TileLength"))? as usize,
            dir.uints(tags::TILE_OFFSETS).ok_or_else(|| invalid("missing TileOffsets"))?,
            dir.uints(tags::TILE_BYTE_COUNTS).ok_or_else(|| invalid("missing TileByteCounts"))?,
        )
    } else {
        let rows_per_strip = dir
            .uint(tags::ROWS_PER_STRIP)
            .map_or(height, |r| (r as usize).min(height));
        (
            width,
            rows_per_strip,
            dir.uints(tags::STRIP_OFFSETS).ok_or_else(|| invalid("missing StripOffsets"))?,
            dir.uints(tags::STRIP_BYTE_COUNTS).ok_or_else(|| invalid("missing StripByteCounts"))?,
        )
    };
    if chunk_width == 0 || chunk_height == 0 {
        return Err(invalid("zero chunk size"));
    }
    if offsets.len() != byte_counts.len() {
        return Err(invalid("offset and byte-count arrays differ in length"));
    }

    let meta = CogMetadata {
        width,
        height,
        chunk_width,
        chunk_height,
        tiled,
        bits_per_sample: dir.uint(tags::BITS_PER_SAMPLE).unwrap_or(8) as u16,
        sample_format: dir.uint(tags::SAMPLE_FORMAT).unwrap_or(1) as u16,
        compression: dir.uint(tags::COMPRESSION).unwrap_or(1) as u16,
        geo_transform: dir.geo_transform().unwrap_or_default(),
        crs: dir.crs(),
        nodata: dir.nodata(),
    };
    let predictor = dir.uint(tags::PREDICTOR).unwrap_or(1) as u16;
    Ok((meta, offsets, byte_counts, predictor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cog::MemorySource;
    use ndvisync_core::io::{write_geotiff_to_buffer, GeoTiffOptions};

    fn sample_raster() -> Raster<f32> {
        let mut raster = Raster::new(7, 5);
        for row in 0..7 {
            for col in 0..5 {
                raster.set(row, col, (row * 10 + col) as f32).unwrap();
            }
        }
        raster.set_transform(GeoTransform::new(500_000.0, 3_800_070.0, 10.0, -10.0));
        raster.set_crs(Some(CRS::from_epsg(32650)));
        raster.set_nodata(Some(-9999.0));
        raster
    }

    fn encode(compression: &str) -> Vec<u8> {
        let options = GeoTiffOptions {
            compression: compression.to_string(),
            tile_size: 3,
            ..Default::default()
        };
        write_geotiff_to_buffer(&sample_raster(), Some(options)).unwrap()
    }

    #[tokio::test]
    async fn test_metadata_from_stripped_file() {
        let reader = CogReader::open(MemorySource::new(encode("LZW")), CogReaderOptions::default())
            .await
            .unwrap();
        let meta = reader.metadata();

        assert_eq!((meta.width, meta.height), (5, 7));
        assert!(!meta.tiled);
        assert_eq!(meta.chunk_height, 3);
        assert_eq!(meta.crs, Some(CRS::from_epsg(32650)));
        assert_eq!(meta.nodata, Some(-9999.0));
        assert_eq!(meta.geo_transform.origin_x, 500_000.0);
        assert_eq!(meta.geo_transform.pixel_height, -10.0);
    }

    #[tokio::test]
    async fn test_window_across_strips() {
        for compression in ["NONE", "LZW", "DEFLATE"] {
            let mut reader =
                CogReader::open(MemorySource::new(encode(compression)), CogReaderOptions::default())
                    .await
                    .unwrap();
            let window = reader.read_window(1, 2, 3, 4).await.unwrap();

            assert_eq!(window.shape(), (4, 3));
            assert_eq!(window.get(0, 0).unwrap(), 21.0);
            assert_eq!(window.get(3, 2).unwrap(), 53.0);
            assert_eq!(window.transform().origin_x, 500_010.0);
            assert_eq!(window.transform().origin_y, 3_800_050.0);
        }
    }

    #[tokio::test]
    async fn test_bbox_read_and_outside() {
        let mut reader = CogReader::open(MemorySource::new(encode("LZW")), CogReaderOptions::default())
            .await
            .unwrap();

        let inside = BBox::new(500_000.0, 3_800_050.0, 500_020.0, 3_800_070.0);
        let raster = reader.read_bbox(&inside).await.unwrap();
        assert_eq!(raster.shape(), (2, 2));
        assert_eq!(raster.get(1, 1).unwrap(), 11.0);

        let outside = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(matches!(
            reader.read_bbox(&outside).await,
            Err(CloudError::BBoxOutside)
        ));
    }

    #[tokio::test]
    async fn test_window_out_of_bounds() {
        let mut reader = CogReader::open(MemorySource::new(encode("NONE")), CogReaderOptions::default())
            .await
            .unwrap();
        assert!(reader.read_window(4, 0, 2, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_garbage() {
        let result = CogReader::open(MemorySource::new(b"not a tiff".to_vec()), CogReaderOptions::default()).await;
        assert!(matches!(result, Err(CloudError::InvalidTiff { .. })));
    }
}
