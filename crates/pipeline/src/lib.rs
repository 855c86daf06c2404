//! # ndvisync pipeline
//!
//! Scheduled NDVI sync: a [`RunCoordinator`] gates each run behind a
//! cross-process lock and a cooldown marker, and a [`SyncPipeline`] runs
//! the stages (composite query, fishnet, tile download and validation,
//! merge, statistics and thumbnail, record upsert).
//!
//! Everything a run needs is injected: the composite source, the lock, the
//! marker cache and the record store all have in-memory or file-backed
//! implementations, so tests construct a fresh coordinator per case.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod downloader;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod retry;
pub mod store;
pub mod sync;

pub use cache::{MarkerCache, MemoryMarkerCache, FIRST_RUN_KEY, LAST_SYNC_KEY};
pub use config::{StacSettings, SyncConfig};
pub use coordinator::{AttemptFailure, RunCoordinator, RunOutcome, RunReport, RunTrigger, SkipReason};
pub use downloader::{clean_partial_tiles, download_tiles, validate_tiles, DownloadOptions, TileArtifact};
pub use error::{Disposition, Result, SyncError};
pub use lock::{FileRunLock, MemoryRunLock, RunLock};
pub use metadata::{read_metadata, write_metadata, RunMetadata, METADATA_FILE};
pub use retry::RetryPolicy;
pub use store::{record_name, IndexRecord, RecordStore, SqliteMarkerCache};
pub use sync::{stac_source, FetchSummary, StacSource, SyncPipeline, SyncSummary, MOSAIC_FILE};
