//! Process-wide serving settings consumed by the dispatch core

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base URL used by plugins for nested calls back into the gateway
pub const DEFAULT_BASE_SERVING_URL: &str = "http://127.0.0.1:8080/serve/";

/// Address of the remote tensor inference server
pub const DEFAULT_TRITON_GRPC_SERVER: &str = "127.0.0.1:8001";

/// Environment variable overriding `serving_timeout_secs`
pub const ENV_SERVING_TIMEOUT: &str = "INFERGATE_SERVING_TIMEOUT";
/// Environment variable overriding `base_serving_url`
pub const ENV_BASE_SERVING_URL: &str = "INFERGATE_BASE_SERVING_URL";
/// Environment variable overriding `triton_grpc_server`
pub const ENV_TRITON_GRPC_SERVER: &str = "INFERGATE_TRITON_GRPC_SERVER";

/// Serving settings shared by every dispatcher in the process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    /// Base URL for nested plugin calls
    #[serde(default)]
    pub base_serving_url: Option<String>,

    /// gRPC address of the remote tensor inference server
    #[serde(default)]
    pub triton_grpc_server: Option<String>,

    /// Total time the front-end allows for one request, in seconds
    #[serde(default = "default_serving_timeout")]
    pub serving_timeout_secs: f64,

    /// Share of the total request timeout granted to outbound calls
    #[serde(default = "default_timeout_fraction")]
    pub timeout_fraction: f64,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            base_serving_url: None,
            triton_grpc_server: None,
            serving_timeout_secs: default_serving_timeout(),
            timeout_fraction: default_timeout_fraction(),
        }
    }
}

impl ServingConfig {
    /// Apply `INFERGATE_*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_SERVING_TIMEOUT) {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 => self.serving_timeout_secs = secs,
                _ => tracing::warn!("Ignoring invalid {}={:?}", ENV_SERVING_TIMEOUT, raw),
            }
        }
        if let Some(url) = lookup(ENV_BASE_SERVING_URL).filter(|v| !v.trim().is_empty()) {
            self.base_serving_url = Some(url);
        }
        if let Some(addr) = lookup(ENV_TRITON_GRPC_SERVER).filter(|v| !v.trim().is_empty()) {
            self.triton_grpc_server = Some(addr);
        }
        self
    }

    /// Timeout applied to every outbound call, whole seconds, at least one
    pub fn request_timeout(&self) -> Duration {
        let secs = (self.serving_timeout_secs * self.timeout_fraction).floor();
        if secs.is_finite() && secs >= 1.0 {
            Duration::from_secs(secs as u64)
        } else {
            Duration::from_secs(1)
        }
    }

    /// Base URL for nested calls, without surrounding slashes
    pub fn base_serving_url(&self) -> &str {
        self.base_serving_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(DEFAULT_BASE_SERVING_URL)
            .trim_matches('/')
    }

    /// Address of the remote tensor inference server
    pub fn triton_grpc_server(&self) -> &str {
        self.triton_grpc_server
            .as_deref()
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or(DEFAULT_TRITON_GRPC_SERVER)
    }
}

fn default_serving_timeout() -> f64 {
    600.0
}

fn default_timeout_fraction() -> f64 {
    0.8
}
