//! Async STAC client for searching spatio-temporal asset catalogs.
//!
//! Supports Planetary Computer and Earth Search out of the box, plus
//! arbitrary STAC API endpoints via [`StacCatalog::Custom`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::auth::{CloudAuth, NoAuth};
use crate::error::{CloudError, Result};
use crate::http::backoff_delay;
use crate::stac_models::{StacItem, StacItemCollection, StacLink, StacSearchParams};

// ---------------------------------------------------------------------------
// Catalog enum
// ---------------------------------------------------------------------------

/// Well-known STAC catalogs plus custom endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum StacCatalog {
    /// Microsoft Planetary Computer STAC API.
    PlanetaryComputer,
    /// AWS Earth Search (Element 84).
    EarthSearch,
    /// Any STAC API endpoint (root URL, e.g. `"https://my-stac.example.com/api/v1"`).
    Custom(String),
}

impl StacCatalog {
    /// Return the full POST `/search` URL for this catalog.
    pub fn search_url(&self) -> String {
        match self {
            Self::PlanetaryComputer => {
                "https://planetarycomputer.microsoft.com/api/stac/v1/search".to_string()
            }
            Self::EarthSearch => "https://earth-search.aws.element84.com/v1/search".to_string(),
            Self::Custom(base) => {
                let base = base.trim_end_matches('/');
                if base.ends_with("/search") {
                    base.to_string()
                } else {
                    format!("{}/search", base)
                }
            }
        }
    }

    /// Parse a shorthand string into a catalog.
    ///
    /// Recognized shorthands: `"pc"`, `"planetary-computer"`, `"es"`,
    /// `"earth-search"`. Anything else is treated as a custom URL.
    pub fn from_str_or_url(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pc" | "planetary-computer" | "planetarycomputer" => Self::PlanetaryComputer,
            "es" | "earth-search" | "earthsearch" => Self::EarthSearch,
            _ => Self::Custom(s.to_string()),
        }
    }

    /// Whether asset hrefs need a SAS token before they can be read.
    pub fn needs_signing(&self) -> bool {
        matches!(self, Self::PlanetaryComputer)
    }
}

// ---------------------------------------------------------------------------
// Search seam
// ---------------------------------------------------------------------------

/// Item search as used by the composite fetcher.
pub trait ItemSearch: Send + Sync {
    /// Every item matching `params`, following pagination.
    fn search_all(&self, params: &StacSearchParams)
        -> impl Future<Output = Result<Vec<StacItem>>> + Send;

    /// Make an asset href readable (e.g. append a SAS token).
    fn sign_href(&self, href: &str) -> impl Future<Output = Result<String>> + Send;
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for [`StacClient`].
pub struct StacClientOptions {
    /// Per-request timeout (default 30 s).
    pub request_timeout: Duration,
    /// Maximum retries on transient failures (default 3).
    pub max_retries: u32,
    /// Maximum total items to fetch across pages (default 500).
    pub max_items: usize,
    /// Credentials attached to every search request (default none).
    pub auth: Arc<dyn CloudAuth>,
}

impl Default for StacClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            max_items: 500,
            auth: Arc::new(NoAuth),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Async client for STAC Item Search.
pub struct StacClient {
    catalog: StacCatalog,
    client: reqwest::Client,
    options: StacClientOptions,
}

impl StacClient {
    pub fn new(catalog: StacCatalog, options: StacClientOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;

        Ok(Self {
            catalog,
            client,
            options,
        })
    }

    pub fn catalog(&self) -> &StacCatalog {
        &self.catalog
    }

    /// Execute a single search request and return one page of results.
    pub async fn search(&self, params: &StacSearchParams) -> Result<StacItemCollection> {
        let url = self.catalog.search_url();
        self.post_search(&url, params).await
    }

    /// Search with automatic pagination, collecting up to `max_items` items.
    pub async fn search_pages(&self, params: &StacSearchParams) -> Result<Vec<StacItem>> {
        let mut all_items: Vec<StacItem> = Vec::new();
        let max = self.options.max_items;

        let mut page = self.search(params).await?;
        loop {
            let next = page.next_link().cloned();
            all_items.append(&mut page.features);

            if all_items.len() >= max {
                warn!(max, "STAC search truncated");
                break;
            }

            match next {
                Some(link) => {
                    page = self.follow_next(&link, params).await?;
                    if page.is_empty() {
                        break;
                    }
                }
                None => break,
            }
        }

        all_items.truncate(max);
        debug!(items = all_items.len(), "STAC search complete");
        Ok(all_items)
    }

    // ── Private helpers ─────────────────────────────────────────────

    fn authorized(&self, url: &str, method: &str, mut req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let mut headers = Vec::new();
        self.options.auth.sign_request(url, method, &mut headers)?;
        for (key, value) in &headers {
            req = req.header(key.as_str(), value.as_str());
        }
        Ok(req)
    }

    async fn post_search(
        &self,
        url: &str,
        params: &StacSearchParams,
    ) -> Result<StacItemCollection> {
        let mut last_err = None;

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let req = self.authorized(url, "POST", self.client.post(url).json(params))?;
            match req.send().await {
                Ok(r) if r.status().is_success() => {
                    let body = r.text().await?;
                    return Ok(serde_json::from_str(&body)?);
                }
                Ok(r) => {
                    let status = r.status();
                    let body = r.text().await.unwrap_or_default();
                    last_err = Some(CloudError::Network(format!(
                        "STAC search returned HTTP {}: {}",
                        status,
                        body.chars().take(500).collect::<String>()
                    )));
                    // Client errors will not change on retry
                    if status.is_client_error() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "STAC search request failed");
                    last_err = Some(CloudError::Http(e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CloudError::Network("STAC search failed".into())))
    }

    /// Follow a pagination link. Handles both POST (body/merge) and GET links.
    async fn follow_next(
        &self,
        link: &StacLink,
        original_params: &StacSearchParams,
    ) -> Result<StacItemCollection> {
        let method = link.method.as_deref().unwrap_or("GET").to_uppercase();

        if method != "POST" {
            let resp = self
                .authorized(&link.href, "GET", self.client.get(&link.href))?
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(CloudError::Network(format!(
                    "STAC pagination returned HTTP {}",
                    resp.status()
                )));
            }
            return Ok(serde_json::from_str(&resp.text().await?)?);
        }

        let body = match (&link.body, link.merge.unwrap_or(false)) {
            (Some(link_body), true) => {
                let mut base = serde_json::to_value(original_params)?;
                if let (Some(base_obj), Some(link_obj)) = (base.as_object_mut(), link_body.as_object()) {
                    for (k, v) in link_obj {
                        base_obj.insert(k.clone(), v.clone());
                    }
                }
                base
            }
            (Some(link_body), false) => link_body.clone(),
            (None, _) => serde_json::to_value(original_params)?,
        };

        let merged: StacSearchParams = serde_json::from_value(body)?;
        self.post_search(&link.href, &merged).await
    }

    /// Sign a single href via the Planetary Computer `/api/sas/v1/sign` endpoint.
    async fn sign_pc_href(&self, href: &str) -> Result<String> {
        let resp = self
            .client
            .get("https://planetarycomputer.microsoft.com/api/sas/v1/sign")
            .query(&[("href", href)])
            .send()
            .await
            .map_err(|e| CloudError::Auth(format!("PC sign request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(CloudError::Auth(format!(
                "PC sign returned HTTP {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CloudError::Auth(format!("parsing PC sign response: {e}")))?;

        body["href"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CloudError::Auth("PC sign response missing 'href' field".into()))
    }
}

impl ItemSearch for StacClient {
    async fn search_all(&self, params: &StacSearchParams) -> Result<Vec<StacItem>> {
        self.search_pages(params).await
    }

    async fn sign_href(&self, href: &str) -> Result<String> {
        if !self.catalog.needs_signing() {
            return Ok(href.to_string());
        }
        self.sign_pc_href(href).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_search_urls() {
        assert_eq!(
            StacCatalog::PlanetaryComputer.search_url(),
            "https://planetarycomputer.microsoft.com/api/stac/v1/search"
        );
        assert_eq!(
            StacCatalog::Custom("https://example.com/stac/".into()).search_url(),
            "https://example.com/stac/search"
        );
        assert_eq!(
            StacCatalog::Custom("https://example.com/stac/search".into()).search_url(),
            "https://example.com/stac/search"
        );
    }

    #[test]
    fn catalog_from_str_or_url() {
        assert_eq!(StacCatalog::from_str_or_url("PC"), StacCatalog::PlanetaryComputer);
        assert_eq!(StacCatalog::from_str_or_url("earth-search"), StacCatalog::EarthSearch);
        // Custom URLs keep their case
        assert_eq!(
            StacCatalog::from_str_or_url("https://My-Stac.com/v1"),
            StacCatalog::Custom("https://My-Stac.com/v1".into())
        );
    }

    #[tokio::test]
    async fn unsigned_catalog_keeps_href() {
        let client = StacClient::new(StacCatalog::EarthSearch, StacClientOptions::default()).unwrap();
        assert!(!client.catalog().needs_signing());
        assert_eq!(
            client.sign_href("https://example.com/B04.tif").await.unwrap(),
            "https://example.com/B04.tif"
        );
    }
}
