//! Render service HTTP client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{RenderError, RenderResult};
use crate::types::{OperationHandle, OperationResult, OperationStatus, RenderRequest};

/// Source of operation status, queried by the poller.
#[async_trait]
pub trait OperationStatusSource: Send + Sync {
    async fn status(&self, operation_id: &str) -> RenderResult<OperationStatus>;
}

/// Submission and result retrieval for the render service.
#[async_trait]
pub trait RenderService: OperationStatusSource {
    async fn submit(&self, request: &RenderRequest) -> RenderResult<OperationHandle>;

    /// Download the rendered video to `dest`; returns the byte count.
    async fn download_result(&self, result: &OperationResult, dest: &Path) -> RenderResult<u64>;
}

/// Configuration for the render client.
#[derive(Debug, Clone)]
pub struct RenderClientConfig {
    /// Base URL of the render service
    pub base_url: String,
    /// Bearer token
    pub api_key: Option<String>,
    /// Request timeout for submit and status calls
    pub timeout: Duration,
    /// Timeout for result downloads
    pub download_timeout: Duration,
    /// Max retries for downloads
    pub max_retries: u32,
}

impl Default for RenderClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8002".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(300),
            max_retries: 2,
        }
    }
}

impl RenderClientConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("RENDER_SERVICE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("RENDER_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(
                std::env::var("RENDER_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            download_timeout: Duration::from_secs(
                std::env::var("RENDER_DOWNLOAD_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            max_retries: std::env::var("RENDER_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
        }
    }
}

/// HTTP client for the render service.
pub struct RenderClient {
    http: Client,
    base: Url,
    config: RenderClientConfig,
}

impl RenderClient {
    /// Create a new render client.
    pub fn new(config: RenderClientConfig) -> RenderResult<Self> {
        // Trailing slash so relative joins keep the base path
        let base = Url::parse(&format!("{}/", config.base_url.trim_end_matches('/')))
            .map_err(|e| RenderError::InvalidResponse(format!("invalid base URL: {}", e)))?;

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(RenderError::Network)?;

        Ok(Self { http, base, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> RenderResult<Self> {
        Self::new(RenderClientConfig::from_env())
    }

    fn url(&self, path: &str) -> RenderResult<Url> {
        self.base
            .join(path)
            .map_err(|e| RenderError::InvalidResponse(format!("invalid URL {}: {}", path, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Check if the render service is reachable.
    pub async fn health_check(&self) -> bool {
        let Ok(url) = self.url("health") else {
            return false;
        };
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Render service health check error: {}", e);
                false
            }
        }
    }

    async fn download_once(&self, url: &Url, dest: &Path) -> RenderResult<u64> {
        let response = self
            .authorize(self.http.get(url.clone()))
            .timeout(self.config.download_timeout)
            .send()
            .await?;
        let response = check_status(response).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            return Err(RenderError::InvalidResponse(
                "rendered video is empty".to_string(),
            ));
        }
        Ok(written)
    }

    /// Execute with retry logic.
    async fn with_retry<F, Fut, T>(&self, operation: F) -> RenderResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = RenderResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        "Render request failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl OperationStatusSource for RenderClient {
    async fn status(&self, operation_id: &str) -> RenderResult<OperationStatus> {
        let url = self.url(&format!("operations/{}", operation_id))?;
        let response = self.authorize(self.http.get(url)).send().await?;
        let response = check_status(response).await?;
        let status: OperationStatus = response.json().await?;
        debug!(operation_id, done = status.done, progress = ?status.progress, "Operation status");
        Ok(status)
    }
}

#[async_trait]
impl RenderService for RenderClient {
    async fn submit(&self, request: &RenderRequest) -> RenderResult<OperationHandle> {
        let url = self.url("operations")?;
        debug!("Submitting render request to {}", url);

        let response = self.authorize(self.http.post(url)).json(request).send().await?;
        let response = check_status(response).await?;
        let handle: OperationHandle = response.json().await?;

        if handle.operation_id.trim().is_empty() {
            return Err(RenderError::InvalidResponse(
                "empty operation id".to_string(),
            ));
        }

        info!(operation_id = %handle.operation_id, "Render operation submitted");
        Ok(handle)
    }

    async fn download_result(&self, result: &OperationResult, dest: &Path) -> RenderResult<u64> {
        // Absolute URIs are used as-is; relative ones resolve against the base.
        let url = match Url::parse(&result.video_uri) {
            Ok(url) => url,
            Err(_) => self.url(result.video_uri.trim_start_matches('/'))?,
        };

        let bytes = self.with_retry(|| self.download_once(&url, dest)).await?;
        info!(bytes, dest = %dest.display(), "Downloaded rendered video");
        Ok(bytes)
    }
}

/// Map non-success responses to transient or permanent errors.
async fn check_status(response: Response) -> RenderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let flagged_permanent = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("permanent").and_then(|p| p.as_bool()))
        .unwrap_or(false);

    let permanent = matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::UNPROCESSABLE_ENTITY
    ) || (status.is_client_error() && flagged_permanent);

    if permanent {
        Err(RenderError::permanent(format!("{}: {}", status, body)))
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(RenderError::unavailable(format!("{}: {}", status, body)))
    } else {
        Err(RenderError::RequestFailed {
            status: status.as_u16(),
            message: body,
        })
    }
}
