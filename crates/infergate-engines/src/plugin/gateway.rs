//! Nested calls back into the serving front-end

use infergate_core::{Error, Result, ServingConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A nested request as plugins describe it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestedRequest {
    pub endpoint: String,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub data: Value,
}

/// HTTP client plugins use to call other endpoints
///
/// Failures never propagate: the caller just gets `None`.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: Arc<str>,
    timeout: Duration,
}

impl GatewayClient {
    /// Client for the configured base URL and request timeout
    pub fn new(serving: &ServingConfig) -> Result<Self> {
        Self::with_base_url(serving.base_serving_url(), serving.request_timeout())
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed building gateway client: {}", e)))?;

        Ok(Self {
            http,
            base_url: Arc::from(base_url.trim_matches('/')),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Full URL for an endpoint and optional version
    pub fn url_for(&self, endpoint: &str, version: Option<&str>) -> String {
        let endpoint = endpoint.trim_matches('/');
        match version.map(|v| v.trim_matches('/')).filter(|v| !v.is_empty()) {
            Some(version) => format!("{}/{}/{}", self.base_url, endpoint, version),
            None => format!("{}/{}", self.base_url, endpoint),
        }
    }

    /// POST `data` to another endpoint and return its decoded JSON body
    pub async fn send_request(
        &self,
        endpoint: &str,
        version: Option<&str>,
        data: &Value,
    ) -> Option<Value> {
        let url = self.url_for(endpoint, version);

        let response = match self.http.post(&url).json(data).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Nested request to {} failed: {}", url, e);
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Nested request to {} returned {}", url, status);
            return None;
        }

        match response.json::<Value>().await {
            Ok(body) => Some(body),
            Err(e) => {
                debug!("Nested response from {} is not JSON: {}", url, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}
