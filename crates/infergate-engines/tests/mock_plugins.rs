//! Mock collaborators for testing
//!
//! Configurable implementations of the plugin, loader, store, engine and
//! transport traits, each counting how often it is called.

#![allow(dead_code)]

use async_trait::async_trait;
use infergate_core::{
    sha256_file, ArtifactStore, EngineKind, Error, ModelStore, Payload, Result, Stage, StatsSink,
};
use infergate_engines::engines::triton::proto::model_infer_response::InferOutputTensor;
use infergate_engines::engines::triton::proto::{ModelInferRequest, ModelInferResponse};
use infergate_engines::engines::triton::InferenceTransport;
use infergate_engines::{
    Capabilities, Engine, GatewayClient, Model, ModelHandle, Plugin, PluginLoader,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Artifact store holding a single artifact in a temp directory
pub struct MockArtifactStore {
    dir: tempfile::TempDir,
    name: String,
    content: Vec<u8>,
    expected_hash: Option<String>,
    fetches: AtomicU32,
    forced_fetches: AtomicU32,
}

impl MockArtifactStore {
    /// Store whose recorded hash matches the content
    pub fn new(name: &str, content: &[u8]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join(".scratch");
        std::fs::write(&scratch, content).unwrap();
        let hash = sha256_file(&scratch).unwrap();
        std::fs::remove_file(&scratch).unwrap();

        Self {
            dir,
            name: name.to_string(),
            content: content.to_vec(),
            expected_hash: Some(hash),
            fetches: AtomicU32::new(0),
            forced_fetches: AtomicU32::new(0),
        }
    }

    /// Override the recorded hash
    pub fn with_expected_hash(mut self, hash: Option<&str>) -> Self {
        self.expected_hash = hash.map(str::to_string);
        self
    }

    /// Put stale content in the local cache
    pub fn with_stale_cache(self, stale: &[u8]) -> Self {
        std::fs::write(self.dir.path().join(&self.name), stale).unwrap();
        self
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn forced_fetches(&self) -> u32 {
        self.forced_fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ArtifactStore for MockArtifactStore {
    fn contains(&self, name: &str) -> bool {
        name == self.name
    }

    async fn local_path(
        &self,
        name: &str,
        force_download: bool,
        _extract_archive: bool,
    ) -> Result<PathBuf> {
        if name != self.name {
            return Err(Error::config(format!("unknown artifact {}", name)));
        }
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let path = self.dir.path().join(name);
        if force_download {
            self.forced_fetches.fetch_add(1, Ordering::Relaxed);
            std::fs::write(&path, &self.content)?;
        } else if !path.exists() {
            std::fs::write(&path, &self.content)?;
        }
        Ok(path)
    }

    async fn expected_hash(&self, _name: &str) -> Result<Option<String>> {
        Ok(self.expected_hash.clone())
    }
}

/// Model store resolving every id to a fixed path
pub struct MockModelStore {
    path: PathBuf,
    lookups: AtomicU32,
}

impl MockModelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lookups: AtomicU32::new(0),
        }
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModelStore for MockModelStore {
    async fn local_model_path(&self, _model_id: &str) -> Result<PathBuf> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.path.clone())
    }
}

/// Model echoing its input under `predicted`
#[derive(Default)]
pub struct MockModel {
    calls: AtomicU32,
}

impl MockModel {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Model for MockModel {
    async fn predict(&self, data: Payload) -> Result<Payload> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(Payload::Json(json!({ "predicted": data.to_json() })))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Plugin wrapping data at each stage it implements
pub struct MockPlugin {
    capabilities: Capabilities,
    failing_stage: Option<Stage>,
    model: Option<ModelHandle>,
    preprocess_calls: AtomicU32,
    process_calls: AtomicU32,
    postprocess_calls: AtomicU32,
    load_calls: AtomicU32,
}

impl MockPlugin {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            failing_stage: None,
            model: None,
            preprocess_calls: AtomicU32::new(0),
            process_calls: AtomicU32::new(0),
            postprocess_calls: AtomicU32::new(0),
            load_calls: AtomicU32::new(0),
        }
    }

    /// Plugin with pre- and postprocess hooks only
    pub fn wrapping() -> Self {
        Self::new(Capabilities {
            preprocess: true,
            postprocess: true,
            ..Capabilities::none()
        })
    }

    /// Make one stage fail on every call
    pub fn failing_at(mut self, stage: Stage) -> Self {
        self.failing_stage = Some(stage);
        self
    }

    /// Model handed out by the load hook
    pub fn with_model(mut self, model: ModelHandle) -> Self {
        self.model = Some(model);
        self
    }

    pub fn preprocess_calls(&self) -> u32 {
        self.preprocess_calls.load(Ordering::Relaxed)
    }

    pub fn process_calls(&self) -> u32 {
        self.process_calls.load(Ordering::Relaxed)
    }

    pub fn postprocess_calls(&self) -> u32 {
        self.postprocess_calls.load(Ordering::Relaxed)
    }

    pub fn load_calls(&self) -> u32 {
        self.load_calls.load(Ordering::Relaxed)
    }

    fn check(&self, stage: Stage) -> Result<()> {
        if self.failing_stage == Some(stage) {
            return Err(Error::plugin(format!("{} blew up", stage)));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn preprocess(&self, request: Payload, stats: &StatsSink) -> Result<Payload> {
        self.preprocess_calls.fetch_add(1, Ordering::Relaxed);
        self.check(Stage::Preprocess)?;
        stats.emit_value(json!({ "stage": "preprocess" }));
        Ok(Payload::Json(json!({ "pre": request.to_json() })))
    }

    async fn postprocess(&self, data: Payload, _stats: &StatsSink) -> Result<Payload> {
        self.postprocess_calls.fetch_add(1, Ordering::Relaxed);
        self.check(Stage::Postprocess)?;
        Ok(Payload::Json(json!({ "post": data.to_json() })))
    }

    async fn process(&self, data: Payload, _stats: &StatsSink) -> Result<Payload> {
        self.process_calls.fetch_add(1, Ordering::Relaxed);
        self.check(Stage::Process)?;
        Ok(Payload::Json(json!({ "processed": data.to_json() })))
    }

    async fn load(&self, _model_path: &Path) -> Result<Option<ModelHandle>> {
        self.load_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.model.clone())
    }
}

/// Loader handing out a prepared plugin, or failing like a broken entry point
pub struct MockPluginLoader {
    plugin: Option<Arc<dyn Plugin>>,
    loads: AtomicU32,
    loaded_paths: parking_lot::Mutex<Vec<PathBuf>>,
}

impl MockPluginLoader {
    pub fn new(plugin: Arc<dyn Plugin>) -> Self {
        Self {
            plugin: Some(plugin),
            loads: AtomicU32::new(0),
            loaded_paths: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            plugin: None,
            loads: AtomicU32::new(0),
            loaded_paths: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.loaded_paths.lock().clone()
    }
}

#[async_trait]
impl PluginLoader for MockPluginLoader {
    async fn load(&self, path: &Path, _gateway: GatewayClient) -> Result<Arc<dyn Plugin>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.loaded_paths.lock().push(path.to_path_buf());
        self.plugin
            .clone()
            .ok_or_else(|| Error::plugin("entry point raised"))
    }
}

/// Backend returning its input unchanged
pub struct MockEngine {
    calls: AtomicU32,
    latency: Option<Duration>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn process(&self, data: Payload, _stats: &StatsSink) -> Result<Payload> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(data)
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Other("mock".to_string())
    }
}

/// Transport that hangs until released, then echoes fp32 input
pub struct StallingTransport {
    stalled: AtomicBool,
    calls: AtomicU32,
}

impl StallingTransport {
    pub fn new() -> Self {
        Self {
            stalled: AtomicBool::new(true),
            calls: AtomicU32::new(0),
        }
    }

    pub fn release(&self) {
        self.stalled.store(false, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl InferenceTransport for StallingTransport {
    async fn model_infer(
        &self,
        request: ModelInferRequest,
        _timeout: Duration,
    ) -> Result<ModelInferResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.stalled.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let input = request.inputs[0].clone();
        let values = input.contents.map(|c| c.fp32_contents).unwrap_or_default();
        Ok(ModelInferResponse {
            outputs: vec![InferOutputTensor {
                name: request.outputs[0].name.clone(),
                datatype: "FP32".to_string(),
                shape: input.shape,
                ..Default::default()
            }],
            raw_output_contents: vec![values.iter().flat_map(|v| v.to_le_bytes()).collect()],
            ..Default::default()
        })
    }
}
