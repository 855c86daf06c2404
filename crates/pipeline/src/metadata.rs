//! Per-run `metadata.json` side-file

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

pub const METADATA_FILE: &str = "metadata.json";

/// Descriptor written next to a run's tiles for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub generated_at: DateTime<Utc>,
    pub source: String,
    pub bands: Vec<String>,
    /// e.g. `EPSG:32650`
    pub crs: String,
    pub resolution: f64,
    pub region: String,
    pub bbox: [f64; 4],
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub grid: [usize; 2],
    pub scene_count: usize,
}

/// Write `meta` to `<dir>/metadata.json` unless the file already exists.
///
/// Returns whether the file was written.
pub fn write_metadata(dir: &Path, meta: &RunMetadata) -> Result<bool> {
    let path = dir.join(METADATA_FILE);
    if path.exists() {
        debug!(path = %path.display(), "metadata already present");
        return Ok(false);
    }
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, serde_json::to_vec_pretty(meta)?)?;
    debug!(path = %path.display(), "metadata written");
    Ok(true)
}

pub fn read_metadata(dir: &Path) -> Result<RunMetadata> {
    let bytes = std::fs::read(dir.join(METADATA_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}
