//! Range-based GeoTIFF reader
//!
//! Reads windows of remote (or in-memory) GeoTIFFs by fetching only the
//! header, the first IFD and the strips/tiles that intersect the window.
//! Cloud Optimized GeoTIFFs are the intended input, but plain stripped
//! files work too.

mod cache;
mod decode;
mod reader;
mod tiff;

pub use decode::{compression, sample_format};
pub use reader::{CogMetadata, CogReader, CogReaderOptions};

use crate::error::Result;
use std::future::Future;

/// Random access to the bytes of one file.
pub trait RangeSource: Send + Sync {
    /// Total size in bytes, when known
    fn size(&self) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Bytes `[offset, offset + length)`; shorter only at end of file
    fn read_range(&self, offset: u64, length: u64) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// A file already held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl RangeSource for MemorySource {
    async fn size(&self) -> Result<Option<u64>> {
        Ok(Some(self.data.len() as u64))
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let start = (offset as usize).min(self.data.len());
        let end = (offset.saturating_add(length) as usize).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}
