//! Backend engine and model traits

use crate::plugin::Plugin;
use async_trait::async_trait;
use futures::future::BoxFuture;
use infergate_core::{
    EndpointConfig, EngineKind, ModelStore, Payload, Result, ServingConfig, StatsSink,
};
use std::sync::Arc;

/// Trait for all inference backends
///
/// One engine instance serves every request of its endpoint, so `process`
/// takes `&self` and keeps per-request state on the stack.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Run inference on preprocessed data
    async fn process(&self, data: Payload, stats: &StatsSink) -> Result<Payload>;

    /// Get the engine kind
    fn kind(&self) -> EngineKind;
}

/// A loaded model that can score data in-process
#[async_trait]
pub trait Model: Send + Sync {
    /// Score `data`, returning the library's raw prediction
    async fn predict(&self, data: Payload) -> Result<Payload>;

    /// Short description for logs
    fn describe(&self) -> String {
        "model".to_string()
    }
}

/// Shared handle to a loaded model
pub type ModelHandle = Arc<dyn Model>;

/// Everything an engine constructor gets to work with
#[derive(Clone)]
pub struct EngineContext {
    /// Endpoint being served
    pub endpoint: Arc<EndpointConfig>,

    /// Process-wide serving settings
    pub serving: Arc<ServingConfig>,

    /// Loaded preprocessing plugin, if any
    pub plugin: Option<Arc<dyn Plugin>>,

    /// Model produced by the plugin's load hook, if any
    pub model: Option<ModelHandle>,

    /// Where to fetch model files from
    pub models: Arc<dyn ModelStore>,
}

impl EngineContext {
    /// Plugin, if it overrides `process`
    pub fn process_override(&self) -> Option<Arc<dyn Plugin>> {
        self.plugin
            .as_ref()
            .filter(|plugin| plugin.capabilities().process)
            .cloned()
    }
}

/// Future returned by engine constructors
pub type EngineFuture = BoxFuture<'static, Result<Arc<dyn Engine>>>;

/// Builds an engine for one endpoint
pub type EngineConstructor = Arc<dyn Fn(EngineContext) -> EngineFuture + Send + Sync>;
