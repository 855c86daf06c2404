//! # ndvisync cloud
//!
//! Remote imagery access for the sync pipeline: STAC item search, HTTP
//! Range reads of Cloud Optimized GeoTIFFs, WGS84/UTM reprojection and the
//! composite fetcher that turns a region and a time window into cloud-free
//! median NDVI tiles.
//!
//! ## Features
//!
//! - `deflate` (default): DEFLATE decompression via `flate2`
//! - `lzw` (default): LZW decompression via `weezl`

pub mod auth;
pub mod bbox;
pub mod cog;
pub mod composite;
pub mod error;
pub mod http;
pub mod reproject;
pub mod stac_client;
pub mod stac_models;

pub use bbox::BBox;
pub use cog::{CogMetadata, CogReader, CogReaderOptions, MemorySource, RangeSource};
pub use composite::{
    CompositeHandle, CompositeRequest, CompositeSource, ExportTarget, StacComposite,
    StacCompositeOptions, StacCompositeSource,
};
pub use error::{CloudError, Result};
pub use stac_client::{ItemSearch, StacCatalog, StacClient, StacClientOptions};
pub use stac_models::{StacItem, StacItemCollection, StacSearchParams};
