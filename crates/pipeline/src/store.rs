//! Persistence of index records
//!
//! Records live in SQLite keyed by their derived name. Every write runs in
//! a transaction, so readers see either the previous record or the full
//! new one. The marker cache shares the same database file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use geo_types::{Coord, LineString, Polygon};
use ndvisync_algorithms::mosaic::list_tiles;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::cache::MarkerCache;
use crate::error::{Result, SyncError};
use crate::metadata::METADATA_FILE;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS index_records (
    name             TEXT PRIMARY KEY,
    acquisition_date TEXT NOT NULL,
    processing_date  TEXT NOT NULL,
    resolution       REAL NOT NULL,
    directory        TEXT NOT NULL,
    min_value        REAL,
    max_value        REAL,
    mean_value       REAL,
    coverage         TEXT,
    thumbnail        BLOB,
    metadata         TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_index_records_acquired
    ON index_records (acquisition_date DESC);
CREATE TABLE IF NOT EXISTS markers (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const SELECT_RECORD: &str = "SELECT name, acquisition_date, processing_date, resolution, directory, \
     min_value, max_value, mean_value, coverage, thumbnail, metadata FROM index_records";

/// Record name for a region and acquisition date, e.g. `henan_ndvi_20240612`.
pub fn record_name(region: &str, date: NaiveDate) -> String {
    format!("{}_ndvi_{}", region, date.format("%Y%m%d"))
}

/// One persisted acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub name: String,
    pub acquisition_date: NaiveDate,
    /// Set on first insert and never changed by later upserts
    pub processing_date: DateTime<Utc>,
    /// Metres per pixel
    pub resolution: f64,
    /// Tile directory relative to the output root
    pub directory: PathBuf,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub mean_value: Option<f64>,
    /// WGS84 footprint
    pub coverage: Option<Polygon<f64>>,
    /// PNG bytes
    pub thumbnail: Option<Vec<u8>>,
    pub metadata: Value,
}

impl IndexRecord {
    pub fn absolute_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.directory)
    }

    /// Sorted `*.tif` files of the record's directory.
    pub fn tile_paths(&self, base: &Path) -> Result<Vec<PathBuf>> {
        let dir = self.absolute_dir(base);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        Ok(list_tiles(&dir)?)
    }
}

/// Non-finite becomes absent; the rest is clamped to the index range.
fn clamp_index(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite()).map(|v| v.clamp(-1.0, 1.0))
}

fn persistence(msg: impl Into<String>) -> SyncError {
    SyncError::Persistence(msg.into())
}

// ---------------------------------------------------------------------------
// GeoJSON
// ---------------------------------------------------------------------------

fn polygon_to_geojson(polygon: &Polygon<f64>) -> String {
    let ring: Vec<[f64; 2]> = polygon.exterior().coords().map(|c| [c.x, c.y]).collect();
    json!({ "type": "Polygon", "coordinates": [ring] }).to_string()
}

fn polygon_from_geojson(text: &str) -> Result<Polygon<f64>> {
    let value: Value = serde_json::from_str(text)?;
    if value["type"] != "Polygon" {
        return Err(persistence(format!("coverage is not a Polygon: {}", value["type"])));
    }
    let ring: Vec<[f64; 2]> = serde_json::from_value(value["coordinates"][0].clone())?;
    let coords: Vec<Coord<f64>> = ring.into_iter().map(|[x, y]| Coord { x, y }).collect();
    Ok(Polygon::new(LineString::from(coords), vec![]))
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

struct RawRecord {
    name: String,
    acquisition_date: String,
    processing_date: String,
    resolution: f64,
    directory: String,
    min_value: Option<f64>,
    max_value: Option<f64>,
    mean_value: Option<f64>,
    coverage: Option<String>,
    thumbnail: Option<Vec<u8>>,
    metadata: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            acquisition_date: row.get(1)?,
            processing_date: row.get(2)?,
            resolution: row.get(3)?,
            directory: row.get(4)?,
            min_value: row.get(5)?,
            max_value: row.get(6)?,
            mean_value: row.get(7)?,
            coverage: row.get(8)?,
            thumbnail: row.get(9)?,
            metadata: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<IndexRecord> {
        let acquisition_date = NaiveDate::parse_from_str(&self.acquisition_date, "%Y-%m-%d")
            .map_err(|e| persistence(format!("bad acquisition_date '{}': {}", self.acquisition_date, e)))?;
        let processing_date = DateTime::parse_from_rfc3339(&self.processing_date)
            .map_err(|e| persistence(format!("bad processing_date '{}': {}", self.processing_date, e)))?
            .with_timezone(&Utc);
        let coverage = self.coverage.as_deref().map(polygon_from_geojson).transpose()?;

        Ok(IndexRecord {
            name: self.name,
            acquisition_date,
            processing_date,
            resolution: self.resolution,
            directory: PathBuf::from(self.directory),
            min_value: self.min_value,
            max_value: self.max_value,
            mean_value: self.mean_value,
            coverage,
            thumbnail: self.thumbnail,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

fn open_connection(path: Option<&Path>) -> Result<Connection> {
    let conn = match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path)?
        }
        None => Connection::open_in_memory()?,
    };
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "opening record store");
        Ok(Self {
            conn: Mutex::new(open_connection(Some(path))?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(None)?),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| persistence("record store lock poisoned"))
    }

    /// Insert or replace the record named `record.name`.
    ///
    /// Stats are sanitized before writing. An existing record keeps its
    /// `processing_date`; every other field, thumbnail included, is
    /// replaced. Returns the record as stored.
    pub fn upsert(&self, record: &IndexRecord) -> Result<IndexRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO index_records (name, acquisition_date, processing_date, resolution, directory, \
                 min_value, max_value, mean_value, coverage, thumbnail, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(name) DO UPDATE SET \
                 acquisition_date = excluded.acquisition_date, \
                 resolution = excluded.resolution, \
                 directory = excluded.directory, \
                 min_value = excluded.min_value, \
                 max_value = excluded.max_value, \
                 mean_value = excluded.mean_value, \
                 coverage = excluded.coverage, \
                 thumbnail = excluded.thumbnail, \
                 metadata = excluded.metadata",
            params![
                record.name,
                record.acquisition_date.format("%Y-%m-%d").to_string(),
                record.processing_date.to_rfc3339(),
                record.resolution,
                record.directory.to_string_lossy().into_owned(),
                clamp_index(record.min_value),
                clamp_index(record.max_value),
                clamp_index(record.mean_value),
                record.coverage.as_ref().map(polygon_to_geojson),
                record.thumbnail,
                record.metadata.to_string(),
            ],
        )?;

        let raw = tx.query_row(&format!("{} WHERE name = ?1", SELECT_RECORD), params![record.name], RawRecord::from_row)?;
        tx.commit()?;

        let stored = raw.into_record()?;
        info!(name = %stored.name, mean = ?stored.mean_value, "record saved");
        Ok(stored)
    }

    pub fn get(&self, name: &str) -> Result<Option<IndexRecord>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(&format!("{} WHERE name = ?1", SELECT_RECORD), params![name], RawRecord::from_row)
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// The `limit` most recent records by acquisition date.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<IndexRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY acquisition_date DESC, name ASC LIMIT ?1",
            SELECT_RECORD
        ))?;
        let raws = stmt
            .query_map(params![limit as i64], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawRecord::into_record).collect()
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM index_records", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Zip the record's tiles and `metadata.json` into `dest`.
    ///
    /// Returns the number of files archived.
    pub fn export_bundle(&self, name: &str, base: &Path, dest: &Path) -> Result<usize> {
        let record = self
            .get(name)?
            .ok_or_else(|| persistence(format!("no record named {}", name)))?;

        let mut files = record.tile_paths(base)?;
        let metadata = record.absolute_dir(base).join(METADATA_FILE);
        if metadata.is_file() {
            files.push(metadata);
        }

        let mut zip = ZipWriter::new(File::create(dest)?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for path in &files {
            let entry = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| persistence(format!("unnamed file {}", path.display())))?;
            zip.start_file(entry, options)?;
            let mut src = File::open(path)?;
            std::io::copy(&mut src, &mut zip)?;
        }
        zip.finish()?;

        info!(name, files = files.len(), dest = %dest.display(), "bundle written");
        Ok(files.len())
    }
}

// ---------------------------------------------------------------------------
// Marker cache
// ---------------------------------------------------------------------------

/// [`MarkerCache`] backed by the `markers` table.
pub struct SqliteMarkerCache {
    conn: Mutex<Connection>,
}

impl SqliteMarkerCache {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(Some(path))?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(None)?),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| persistence("marker cache lock poisoned"))
    }
}

impl MarkerCache for SqliteMarkerCache {
    fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM markers WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        value
            .map(|v| {
                DateTime::parse_from_rfc3339(&v)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| persistence(format!("bad marker '{}' = '{}': {}", key, v, e)))
            })
            .transpose()
    }

    fn set(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO markers (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use geo_types::polygon;
    use std::io::Read;

    fn record(name: &str, date: (i32, u32, u32), mean: f64) -> IndexRecord {
        IndexRecord {
            name: name.to_string(),
            acquisition_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            processing_date: Utc.with_ymd_and_hms(date.0, date.1, date.2, 1, 0, 0).unwrap(),
            resolution: 10.0,
            directory: PathBuf::from(name),
            min_value: Some(mean - 0.1),
            max_value: Some(mean + 0.1),
            mean_value: Some(mean),
            coverage: Some(polygon![
                (x: 110.9, y: 31.6),
                (x: 116.6, y: 31.6),
                (x: 116.6, y: 35.0),
                (x: 110.9, y: 35.0),
            ]),
            thumbnail: Some(vec![1, 2, 3]),
            metadata: json!({ "scenes": 4 }),
        }
    }

    #[test]
    fn test_record_name() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 12).unwrap();
        assert_eq!(record_name("henan", date), "henan_ndvi_20240612");
    }

    #[test]
    fn test_upsert_replaces_but_keeps_processing_date() {
        let store = RecordStore::open_in_memory().unwrap();
        let first = record("henan_ndvi_20240612", (2024, 6, 12), 0.3);
        store.upsert(&first).unwrap();

        let mut second = record("henan_ndvi_20240612", (2024, 6, 12), 0.5);
        second.processing_date = first.processing_date + chrono::Duration::hours(5);
        second.thumbnail = Some(vec![9, 9]);
        let stored = store.upsert(&second).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(stored.mean_value, Some(0.5));
        assert_eq!(stored.thumbnail, Some(vec![9, 9]));
        assert_eq!(stored.processing_date, first.processing_date);
        assert_eq!(stored.coverage, second.coverage);
        assert_eq!(stored.metadata, json!({ "scenes": 4 }));
    }

    #[test]
    fn test_stats_sanitized_on_save() {
        let store = RecordStore::open_in_memory().unwrap();
        let mut r = record("henan_ndvi_20240612", (2024, 6, 12), 0.3);
        r.min_value = Some(f64::NEG_INFINITY);
        r.max_value = Some(1.7);
        r.mean_value = Some(f64::NAN);

        let stored = store.upsert(&r).unwrap();
        assert_eq!(stored.min_value, None);
        assert_eq!(stored.max_value, Some(1.0));
        assert_eq!(stored.mean_value, None);
    }

    #[test]
    fn test_list_recent_orders_by_acquisition() {
        let store = RecordStore::open_in_memory().unwrap();
        store.upsert(&record("henan_ndvi_20240605", (2024, 6, 5), 0.2)).unwrap();
        store.upsert(&record("henan_ndvi_20240619", (2024, 6, 19), 0.4)).unwrap();
        store.upsert(&record("henan_ndvi_20240612", (2024, 6, 12), 0.3)).unwrap();

        let names: Vec<_> = store.list_recent(2).unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["henan_ndvi_20240619", "henan_ndvi_20240612"]);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_export_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(&dir.path().join("db").join("ndvisync.db")).unwrap();
        let r = record("henan_ndvi_20240612", (2024, 6, 12), 0.3);
        let run_dir = r.absolute_dir(dir.path());
        std::fs::create_dir_all(run_dir.join("mosaic")).unwrap();
        std::fs::write(run_dir.join("tile_r00_c00.tif"), b"tile-a").unwrap();
        std::fs::write(run_dir.join("tile_r00_c01.tif"), b"tile-b").unwrap();
        std::fs::write(run_dir.join(METADATA_FILE), b"{}").unwrap();
        std::fs::write(run_dir.join("mosaic").join("mosaic.tif"), b"big").unwrap();
        store.upsert(&r).unwrap();

        let dest = dir.path().join("bundle.zip");
        assert_eq!(store.export_bundle(&r.name, dir.path(), &dest).unwrap(), 3);

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["metadata.json", "tile_r00_c00.tif", "tile_r00_c01.tif"]);

        let mut body = String::new();
        archive.by_name("tile_r00_c01.tif").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "tile-b");

        assert!(store.export_bundle("missing", dir.path(), &dest).is_err());
    }

    #[test]
    fn test_sqlite_marker_cache_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ndvisync.db");
        let t = Utc.with_ymd_and_hms(2024, 6, 12, 3, 30, 0).unwrap();

        {
            let cache = SqliteMarkerCache::open(&path).unwrap();
            assert_eq!(cache.get("last_ndvi_sync").unwrap(), None);
            cache.set("last_ndvi_sync", t).unwrap();
            cache.set("last_ndvi_sync", t + chrono::Duration::days(7)).unwrap();
        }

        let cache = SqliteMarkerCache::open(&path).unwrap();
        assert_eq!(cache.get("last_ndvi_sync").unwrap(), Some(t + chrono::Duration::days(7)));
    }
}
