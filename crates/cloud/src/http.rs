//! HTTP client wrapper with Range request support and retry logic.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::auth::CloudAuth;
use crate::cog::RangeSource;
use crate::error::{CloudError, Result};

/// Delay before retry `attempt` (1-based): 500 ms, 1 s, 2 s, ...
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1 << attempt.saturating_sub(1).min(16)))
}

/// HTTP client for fetching byte ranges from remote files.
pub struct HttpClient {
    client: Client,
    max_retries: u32,
}

/// Response from a HEAD request.
pub struct HeadInfo {
    /// Total file size in bytes, if reported by the server.
    pub content_length: Option<u64>,
    /// Whether the server advertises Range support.
    pub accept_ranges: bool,
}

impl HttpClient {
    pub fn new(request_timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, max_retries })
    }

    fn signed(&self, req: RequestBuilder, url: &str, method: &str, auth: &dyn CloudAuth) -> Result<RequestBuilder> {
        let mut headers = Vec::new();
        auth.sign_request(url, method, &mut headers)?;
        Ok(headers
            .iter()
            .fold(req, |req, (key, value)| req.header(key.as_str(), value.as_str())))
    }

    /// Send a HEAD request to discover file size and Range support.
    pub async fn head(&self, url: &str, auth: &dyn CloudAuth) -> Result<HeadInfo> {
        let req = self.signed(self.client.head(url), url, "HEAD", auth)?;
        let resp = self.execute_with_retry(req).await?;

        let accept_ranges = resp
            .headers()
            .get("accept-ranges")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("bytes"));

        let content_length = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        Ok(HeadInfo {
            content_length,
            accept_ranges,
        })
    }

    /// Fetch bytes `[offset, offset + length)` of a remote file.
    pub async fn fetch_range(
        &self,
        url: &str,
        offset: u64,
        length: u64,
        auth: &dyn CloudAuth,
    ) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let range_value = format!("bytes={}-{}", offset, offset + length - 1);
        let req = self.signed(self.client.get(url).header("Range", &range_value), url, "GET", auth)?;

        let resp = self.execute_with_retry(req).await?;
        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE
            || (status.is_success() && status != StatusCode::PARTIAL_CONTENT)
        {
            return Err(CloudError::RangeNotSupported {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(CloudError::Network(format!("HTTP {} fetching {}", status, url)));
        }

        let bytes = resp.bytes().await?;
        debug!(url, offset, length, received = bytes.len(), "range fetched");
        Ok(bytes.to_vec())
    }

    /// Send with exponential backoff on timeouts, connection failures and
    /// 5xx responses.
    async fn execute_with_retry(&self, request: RequestBuilder) -> Result<Response> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let Some(cloned) = request.try_clone() else {
                return Ok(request.send().await?);
            };
            match cloned.send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(attempt, status = %resp.status(), "server error, retrying");
                    last_err = Some(CloudError::Network(format!("HTTP {}", resp.status())));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    let err = CloudError::from(e);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    warn!(attempt, error = %err, "request failed, retrying");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CloudError::Network("request failed".into())))
    }
}

/// One remote file read through HTTP Range requests.
pub struct HttpRangeSource {
    client: Arc<HttpClient>,
    url: String,
    auth: Arc<dyn CloudAuth>,
}

impl HttpRangeSource {
    pub fn new(client: Arc<HttpClient>, url: impl Into<String>, auth: Arc<dyn CloudAuth>) -> Self {
        Self {
            client,
            url: url.into(),
            auth,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RangeSource for HttpRangeSource {
    async fn size(&self) -> Result<Option<u64>> {
        let head = self.client.head(&self.url, self.auth.as_ref()).await?;
        if !head.accept_ranges {
            debug!(url = %self.url, "server does not advertise Accept-Ranges");
        }
        Ok(head.content_length)
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.client
            .fetch_range(&self.url, offset, length, self.auth.as_ref())
            .await
    }
}
