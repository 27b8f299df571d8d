//! Fetching, verifying and loading an endpoint's plugin

use super::{GatewayClient, Plugin, PluginLoader};
use crate::engine::ModelHandle;
use infergate_core::{sha256_file, ArtifactStore, EndpointConfig, Error, ModelStore, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// A plugin together with the model its load hook produced
#[derive(Clone)]
pub struct LoadedPlugin {
    pub plugin: Arc<dyn Plugin>,
    pub model: Option<ModelHandle>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("model", &self.model.as_ref().map(|m| m.describe()))
            .finish_non_exhaustive()
    }
}

/// Collaborators needed to bring a plugin up
pub struct PluginHost<'a> {
    pub artifacts: &'a dyn ArtifactStore,
    pub models: &'a dyn ModelStore,
    pub loader: &'a dyn PluginLoader,
    pub gateway: &'a GatewayClient,
}

impl PluginHost<'_> {
    /// Load the endpoint's preprocessing artifact, if it has one
    ///
    /// Anything that goes wrong after the artifact is located is reported
    /// as a load error naming the artifact.
    pub async fn load(&self, endpoint: &EndpointConfig) -> Result<Option<LoadedPlugin>> {
        let Some(artifact) = endpoint.preprocess_artifact.as_deref() else {
            return Ok(None);
        };

        if !self.artifacts.contains(artifact) {
            return Err(Error::config(format!(
                "could not find preprocessing artifact '{}' for endpoint '{}'",
                artifact,
                endpoint.endpoint_path()
            )));
        }

        let loaded = self
            .load_artifact(artifact, endpoint)
            .await
            .map_err(|e| Error::load(artifact, e))?;

        info!(
            "Loaded preprocess artifact '{}' for endpoint '{}'",
            artifact,
            endpoint.endpoint_path()
        );
        Ok(Some(loaded))
    }

    async fn load_artifact(
        &self,
        artifact: &str,
        endpoint: &EndpointConfig,
    ) -> Result<LoadedPlugin> {
        let path = self.verified_path(artifact).await?;
        let plugin = self.loader.load(&path, self.gateway.clone()).await?;

        let model = if plugin.capabilities().load {
            let model_path = self
                .models
                .local_model_path(endpoint.require_model_id()?)
                .await?;
            debug!("Plugin load hook for model at {}", model_path.display());
            plugin.load(&model_path).await?
        } else {
            None
        };

        Ok(LoadedPlugin { plugin, model })
    }

    /// Local artifact path, forcing one fresh fetch if the cached copy is stale
    async fn verified_path(&self, artifact: &str) -> Result<PathBuf> {
        let cached = self.artifacts.local_path(artifact, false, false).await?;
        let current = sha256_file(&cached)?;
        let expected = self.artifacts.expected_hash(artifact).await?;

        if expected.as_deref().map(str::to_ascii_lowercase).as_deref() == Some(current.as_str()) {
            debug!("Artifact '{}' hash verified", artifact);
            return self.artifacts.local_path(artifact, false, true).await;
        }

        info!("Re-downloading artifact '{}' hash changed", artifact);
        self.artifacts.local_path(artifact, true, true).await
    }
}
