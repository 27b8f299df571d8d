//! Preprocessing plugins
//!
//! A plugin is user code attached to an endpoint. It may implement any of
//! four hooks; each hook it leaves out is a pass-through.

mod gateway;
mod host;
mod wasm;

pub use gateway::{GatewayClient, NestedRequest};
pub use host::{LoadedPlugin, PluginHost};
pub use wasm::WasmPluginLoader;

use crate::engine::ModelHandle;
use async_trait::async_trait;
use infergate_core::{Error, Payload, Result, StatsSink};
use std::path::Path;
use std::sync::Arc;

/// Hooks a plugin implements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub preprocess: bool,
    pub postprocess: bool,
    pub process: bool,
    pub load: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            preprocess: true,
            postprocess: true,
            process: true,
            load: true,
        }
    }
}

/// User-supplied request processing code
///
/// Hooks not reported by `capabilities` are never called.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Transform the raw request before the backend sees it
    async fn preprocess(&self, request: Payload, _stats: &StatsSink) -> Result<Payload> {
        Ok(request)
    }

    /// Transform the backend result before it is returned
    async fn postprocess(&self, data: Payload, _stats: &StatsSink) -> Result<Payload> {
        Ok(data)
    }

    /// Replace the backend call entirely
    async fn process(&self, _data: Payload, _stats: &StatsSink) -> Result<Payload> {
        Err(Error::plugin("plugin does not implement process"))
    }

    /// Load the endpoint's model, optionally returning a handle backends use
    async fn load(&self, _model_path: &Path) -> Result<Option<ModelHandle>> {
        Ok(None)
    }
}

/// Turns a fetched artifact into a live plugin
#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Load the code unit at `path`, running its entry point once
    async fn load(&self, path: &Path, gateway: GatewayClient) -> Result<Arc<dyn Plugin>>;
}
