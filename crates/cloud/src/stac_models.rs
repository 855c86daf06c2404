//! STAC (SpatioTemporal Asset Catalog) data types.
//!
//! Serde models for STAC Item Search (`POST /search`): the request body with
//! bbox, datetime range, collections and `query` filters, and the
//! FeatureCollection response with pagination links and assets.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::bbox::BBox;
use crate::error::{CloudError, Result};

// ---------------------------------------------------------------------------
// Search request
// ---------------------------------------------------------------------------

/// Body for `POST /search` (STAC API – Item Search).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StacSearchParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Property filters (STAC API query extension), e.g.
    /// `{"eo:cloud_cover": {"lt": 20}}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Map<String, serde_json::Value>>,

    /// Pagination token (next page).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl StacSearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bounding box `[west, south, east, north]`.
    pub fn bbox(mut self, bbox: &BBox) -> Self {
        self.bbox = Some(bbox.to_array().to_vec());
        self
    }

    /// Set a closed datetime interval `start/end` (RFC 3339, UTC).
    pub fn datetime_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.datetime = Some(format!(
            "{}/{}",
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            end.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        self
    }

    pub fn collection(mut self, name: &str) -> Self {
        self.collections = Some(vec![name.to_string()]);
        self
    }

    /// Set maximum items per page.
    pub fn limit(mut self, n: u32) -> Self {
        self.limit = Some(n);
        self
    }

    /// Keep items whose `eo:cloud_cover` is strictly below `percent`.
    pub fn cloud_cover_below(self, percent: f64) -> Self {
        self.filter("eo:cloud_cover", "lt", serde_json::json!(percent))
    }

    /// Add one `query` clause `property op value`.
    pub fn filter(mut self, property: &str, op: &str, value: serde_json::Value) -> Self {
        let query = self.query.get_or_insert_with(Default::default);
        let clause = query
            .entry(property.to_string())
            .or_insert_with(|| serde_json::json!({}));
        if let Some(ops) = clause.as_object_mut() {
            ops.insert(op.to_string(), value);
        }
        self
    }

    /// Set pagination token.
    pub fn token(mut self, tok: &str) -> Self {
        self.token = Some(tok.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// A STAC Item Collection (GeoJSON FeatureCollection).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StacItemCollection {
    #[serde(rename = "type")]
    pub type_: String,

    pub features: Vec<StacItem>,

    #[serde(default)]
    pub links: Vec<StacLink>,

    #[serde(rename = "numberMatched", skip_serializing_if = "Option::is_none")]
    pub number_matched: Option<u64>,

    #[serde(rename = "numberReturned", skip_serializing_if = "Option::is_none")]
    pub number_returned: Option<u64>,
}

impl StacItemCollection {
    /// Find the `"next"` pagination link, if any.
    pub fn next_link(&self) -> Option<&StacLink> {
        self.links.iter().find(|l| l.rel == "next")
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// A single STAC Item (GeoJSON Feature): one acquired scene.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StacItem {
    #[serde(rename = "type")]
    pub type_: String,

    /// Scene identifier, shared between a scene and its auxiliary products.
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<serde_json::Value>,

    /// Bounding box `[west, south, east, north]` in WGS84.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>,

    pub properties: StacItemProperties,

    #[serde(default)]
    pub assets: HashMap<String, StacAsset>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    #[serde(default)]
    pub links: Vec<StacLink>,
}

impl StacItem {
    pub fn asset(&self, key: &str) -> Option<&StacAsset> {
        self.assets.get(key)
    }

    /// Href of asset `key`, or [`CloudError::MissingAsset`].
    pub fn asset_href(&self, key: &str) -> Result<&str> {
        self.asset(key)
            .map(|a| a.href.as_str())
            .ok_or_else(|| CloudError::MissingAsset {
                item: self.id.clone(),
                key: key.to_string(),
            })
    }

    /// WGS84 footprint, when the item carries a 2D bbox
    pub fn footprint(&self) -> Option<BBox> {
        BBox::from_slice(self.bbox.as_deref()?)
    }

    /// Acquisition time
    pub fn acquired(&self) -> Option<DateTime<Utc>> {
        let text = self.properties.datetime.as_deref()?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// EPSG code from `proj:epsg`, or from `proj:code` (`"EPSG:32650"`).
    pub fn epsg(&self) -> Option<u32> {
        let extra = &self.properties.extra;
        if let Some(code) = extra.get("proj:epsg").and_then(|v| v.as_u64()) {
            return u32::try_from(code).ok();
        }
        extra
            .get("proj:code")
            .and_then(|v| v.as_str())
            .and_then(|s| s.strip_prefix("EPSG:"))
            .and_then(|s| s.parse().ok())
    }
}

/// STAC Item properties.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StacItemProperties {
    /// ISO 8601 datetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,

    /// Scene-level cloud cover percentage (EO extension).
    #[serde(rename = "eo:cloud_cover", skip_serializing_if = "Option::is_none")]
    pub eo_cloud_cover: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    /// All other properties we don't model explicitly.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A single STAC Asset (file reference).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StacAsset {
    pub href: String,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Roles: `["data"]`, `["thumbnail"]`, `["overview"]`, etc.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A STAC Link (used for pagination and related resources).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StacLink {
    /// Relationship: `"self"`, `"root"`, `"next"`, `"prev"`, etc.
    pub rel: String,

    pub href: String,

    /// HTTP method for the link (default GET, but `"next"` often uses POST).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Request body for POST-based pagination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    /// If true, merge `body` into the previous request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<bool>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
