//! REST collaborator: the three backend calls the scan subsystem consumes.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::types::{ScanInfo, ScanSessionStatus, StartScanRequest, StartScanResponse};

#[async_trait]
pub trait ScanApi: Send + Sync {
    async fn start_scan(
        &self,
        node: &str,
        request: &StartScanRequest,
    ) -> Result<StartScanResponse, ApiError>;

    async fn session_status(&self, session_id: &str) -> Result<ScanSessionStatus, ApiError>;

    async fn running_scans(&self, node: &str) -> Result<Vec<ScanInfo>, ApiError>;
}

/// `ScanApi` over HTTP.
///
/// Routes, relative to the base URL:
/// - `POST nodes/{node}/scans`
/// - `GET scans/sessions/{session_id}/status`
/// - `GET nodes/{node}/scans/running`
#[derive(Debug, Clone)]
pub struct HttpScanApi {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpScanApi {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| ApiError::Url(format!("{}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::Url(config.base_url.clone()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            base,
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl ScanApi for HttpScanApi {
    async fn start_scan(
        &self,
        node: &str,
        request: &StartScanRequest,
    ) -> Result<StartScanResponse, ApiError> {
        let url = self.endpoint(&["nodes", node, "scans"])?;
        debug!(%url, scanners = ?request.scanners, "starting scan session");
        let resp = self
            .authorize(self.client.post(url))
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    async fn session_status(&self, session_id: &str) -> Result<ScanSessionStatus, ApiError> {
        let url = self.endpoint(&["scans", "sessions", session_id, "status"])?;
        let resp = self.authorize(self.client.get(url)).send().await?;
        decode(resp).await
    }

    async fn running_scans(&self, node: &str) -> Result<Vec<ScanInfo>, ApiError> {
        let url = self.endpoint(&["nodes", node, "scans", "running"])?;
        let resp = self.authorize(self.client.get(url)).send().await?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<T>().await?);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        message: server_message(&body),
    })
}

/// Pull a human-readable message out of an error body (`detail`, `message` or `error`).
pub fn server_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["detail", "message", "error"]
        .iter()
        .find_map(|key| value.get(*key)?.as_str())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}
