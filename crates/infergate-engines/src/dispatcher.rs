//! Request dispatch pipeline
//!
//! One [`Dispatcher`] serves one endpoint. It is built once, before traffic,
//! and then shared by every request to that endpoint.

use crate::engine::{Engine, EngineContext, ModelHandle};
use crate::plugin::{
    Capabilities, GatewayClient, Plugin, PluginHost, PluginLoader, WasmPluginLoader,
};
use crate::registry::EngineRegistry;
use futures::FutureExt;
use infergate_core::{
    ArtifactStore, EndpointConfig, Error, FsArtifactStore, FsModelStore, ModelStore, Payload,
    Result, ServingConfig, Stage, StatsSink,
};
use metrics::{counter, histogram};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Shared collaborators for building dispatchers
#[derive(Clone)]
pub struct ServingContext {
    registry: Arc<EngineRegistry>,
    serving: Arc<ServingConfig>,
    artifacts: Arc<dyn ArtifactStore>,
    models: Arc<dyn ModelStore>,
    plugin_loader: Arc<dyn PluginLoader>,
    gateway: GatewayClient,
}

impl ServingContext {
    pub fn builder() -> ServingContextBuilder {
        ServingContextBuilder::default()
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub fn serving(&self) -> &ServingConfig {
        &self.serving
    }

    pub fn gateway(&self) -> &GatewayClient {
        &self.gateway
    }

    fn plugin_host(&self) -> PluginHost<'_> {
        PluginHost {
            artifacts: self.artifacts.as_ref(),
            models: self.models.as_ref(),
            loader: self.plugin_loader.as_ref(),
            gateway: &self.gateway,
        }
    }
}

/// Builder for [`ServingContext`]
#[derive(Default)]
pub struct ServingContextBuilder {
    registry: Option<Arc<EngineRegistry>>,
    serving: Option<ServingConfig>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    models: Option<Arc<dyn ModelStore>>,
    plugin_loader: Option<Arc<dyn PluginLoader>>,
}

impl ServingContextBuilder {
    pub fn registry(mut self, registry: Arc<EngineRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn serving(mut self, serving: ServingConfig) -> Self {
        self.serving = Some(serving);
        self
    }

    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn models(mut self, models: Arc<dyn ModelStore>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn plugin_loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.plugin_loader = Some(loader);
        self
    }

    /// Fill in defaults and build
    pub fn build(self) -> Result<ServingContext> {
        let serving = self.serving.unwrap_or_default();
        let gateway = GatewayClient::new(&serving)?;

        Ok(ServingContext {
            registry: self.registry.unwrap_or_else(EngineRegistry::global),
            serving: Arc::new(serving),
            artifacts: self
                .artifacts
                .unwrap_or_else(|| Arc::new(FsArtifactStore::from_config(&Default::default()))),
            models: self
                .models
                .unwrap_or_else(|| Arc::new(FsModelStore::default())),
            plugin_loader: self
                .plugin_loader
                .unwrap_or_else(|| Arc::new(WasmPluginLoader::new())),
            gateway,
        })
    }
}

/// Runs requests for one endpoint through preprocess, process and postprocess
pub struct Dispatcher {
    endpoint: Arc<EndpointConfig>,
    plugin: Option<Arc<dyn Plugin>>,
    capabilities: Capabilities,
    model: Option<ModelHandle>,
    engine: Arc<dyn Engine>,
    endpoint_label: String,
    engine_label: String,
}

impl Dispatcher {
    /// Resolve the engine, load the plugin and build the backend
    pub async fn new(endpoint: EndpointConfig, ctx: &ServingContext) -> Result<Self> {
        let constructor = ctx.registry.resolve(endpoint.engine.as_str())?;
        let endpoint = Arc::new(endpoint);
        let endpoint_label = endpoint.endpoint_path();

        let loaded = ctx.plugin_host().load(&endpoint).await?;
        let (plugin, model) = match loaded {
            Some(loaded) => (Some(loaded.plugin), loaded.model),
            None => (None, None),
        };
        let capabilities = plugin
            .as_ref()
            .map(|p| p.capabilities())
            .unwrap_or_default();

        let engine = constructor(EngineContext {
            endpoint: Arc::clone(&endpoint),
            serving: Arc::clone(&ctx.serving),
            plugin: plugin.clone(),
            model: model.clone(),
            models: Arc::clone(&ctx.models),
        })
        .await?;
        let engine_label = engine.kind().to_string();

        info!(
            "Dispatcher ready for '{}' (engine: {}, plugin: {})",
            endpoint_label,
            engine_label,
            plugin.is_some()
        );

        Ok(Self {
            endpoint,
            plugin,
            capabilities,
            model,
            engine,
            endpoint_label,
            engine_label,
        })
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn has_plugin(&self) -> bool {
        self.plugin.is_some()
    }

    pub fn model(&self) -> Option<&ModelHandle> {
        self.model.as_ref()
    }

    /// Run one request through the whole pipeline
    pub async fn handle(&self, request: Payload, stats: &StatsSink) -> Result<Payload> {
        let started = Instant::now();
        counter!(
            "infergate_requests_total",
            "endpoint" => self.endpoint_label.clone(),
            "engine" => self.engine_label.clone()
        )
        .increment(1);

        let span = info_span!(
            "dispatch",
            endpoint = %self.endpoint_label,
            engine = %self.engine_label
        );
        let result = async {
            let data = self.preprocess(request, stats).await?;
            let data = self.process(data, stats).await?;
            self.postprocess(data, stats).await
        }
        .instrument(span)
        .await;

        histogram!(
            "infergate_request_latency_us",
            "endpoint" => self.endpoint_label.clone(),
            "engine" => self.engine_label.clone()
        )
        .record(started.elapsed().as_micros() as f64);

        match &result {
            Ok(_) => debug!("Request to '{}' done in {:?}", self.endpoint_label, started.elapsed()),
            Err(e) => {
                counter!(
                    "infergate_request_errors_total",
                    "endpoint" => self.endpoint_label.clone(),
                    "engine" => self.engine_label.clone()
                )
                .increment(1);
                warn!("Request to '{}' failed: {}", self.endpoint_label, e);
            }
        }
        result
    }

    pub async fn preprocess(&self, request: Payload, stats: &StatsSink) -> Result<Payload> {
        match &self.plugin {
            Some(plugin) if self.capabilities.preprocess => {
                run_stage(Stage::Preprocess, plugin.preprocess(request, stats)).await
            }
            _ => Ok(request),
        }
    }

    pub async fn process(&self, data: Payload, stats: &StatsSink) -> Result<Payload> {
        run_stage(Stage::Process, self.engine.process(data, stats)).await
    }

    pub async fn postprocess(&self, data: Payload, stats: &StatsSink) -> Result<Payload> {
        match &self.plugin {
            Some(plugin) if self.capabilities.postprocess => {
                run_stage(Stage::Postprocess, plugin.postprocess(data, stats)).await
            }
            _ => Ok(data),
        }
    }
}

/// Await a stage, tagging its failure (or panic) with the stage
async fn run_stage<F>(stage: Stage, fut: F) -> Result<Payload>
where
    F: Future<Output = Result<Payload>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result.map_err(|e| Error::request(stage, e)),
        Err(_) => Err(Error::request(stage, Error::plugin(format!("{} panicked", stage)))),
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("endpoint", &self.endpoint_label)
            .field("engine", &self.engine_label)
            .field("capabilities", &self.capabilities)
            .field("model", &self.model.as_ref().map(|m| m.describe()))
            .finish()
    }
}
