//! Deployment file

use anyhow::{anyhow, Context, Result};
use infergate_core::{ArtifactStoreConfig, EndpointConfig, ModelStoreConfig, ServingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything needed to build dispatchers for a set of endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub serving: ServingConfig,

    /// Preprocessing code artifacts
    #[serde(default)]
    pub artifacts: ArtifactStoreConfig,

    /// Model files
    #[serde(default)]
    pub models: ModelStoreConfig,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl DeploymentConfig {
    /// Load a deployment file; relative paths resolve against its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read deployment file {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid deployment file {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.serving = config.serving.with_env_overrides();
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        if let Some(dir) = self.artifacts.cache_dir.as_mut() {
            resolve(dir);
        }
        for entry in self.artifacts.artifacts.values_mut() {
            resolve(&mut entry.source);
        }
        if let Some(root) = self.models.root.as_mut() {
            resolve(root);
        }
        for path in self.models.models.values_mut() {
            resolve(path);
        }
    }

    /// Endpoint whose path, with or without version, matches `path`
    pub fn endpoint(&self, path: &str) -> Result<&EndpointConfig> {
        let path = path.trim_matches('/');
        self.endpoints
            .iter()
            .find(|e| e.endpoint_path() == path)
            .or_else(|| {
                self.endpoints
                    .iter()
                    .find(|e| e.serving_url.trim_matches('/') == path)
            })
            .ok_or_else(|| {
                let known: Vec<String> = self.endpoints.iter().map(|e| e.endpoint_path()).collect();
                anyhow!("no endpoint '{}' (configured: {})", path, known.join(", "))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergate_core::EngineKind;

    const DEPLOYMENT: &str = r#"
serving:
  serving_timeout_secs: 30
artifacts:
  cache_dir: cache
  artifacts:
    digits.wasm:
      source: plugins/digits.wasm
      sha256: abc
models:
  root: /srv/models
  models:
    price: weights/price.json
endpoints:
  - engine: triton
    serving_url: digits
    version: "2"
    input_name: INPUT__0
    input_type: float32
    input_size: [1, 784]
    output_name: OUTPUT__0
    output_type: float32
    preprocess_artifact: digits.wasm
  - engine: sklearn
    serving_url: price
    model_id: price
"#;

    fn load() -> (tempfile::TempDir, DeploymentConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.yaml");
        std::fs::write(&path, DEPLOYMENT).unwrap();
        let config = DeploymentConfig::from_file(&path).unwrap();
        (dir, config)
    }

    #[test]
    fn test_parse_deployment() {
        let (_dir, config) = load();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.serving.serving_timeout_secs, 30.0);
        assert_eq!(config.endpoints[0].engine, EngineKind::Triton);
    }

    #[test]
    fn test_relative_paths_resolved() {
        let (dir, config) = load();
        assert_eq!(config.artifacts.cache_dir, Some(dir.path().join("cache")));
        assert_eq!(
            config.artifacts.artifacts["digits.wasm"].source,
            dir.path().join("plugins/digits.wasm")
        );
        assert_eq!(config.models.root, Some(PathBuf::from("/srv/models")));
        assert_eq!(config.models.models["price"], dir.path().join("weights/price.json"));
    }

    #[test]
    fn test_endpoint_lookup() {
        let (_dir, config) = load();
        assert_eq!(config.endpoint("digits/2").unwrap().serving_url, "digits");
        assert_eq!(config.endpoint("/digits/").unwrap().version, "2");
        assert_eq!(config.endpoint("price").unwrap().engine, EngineKind::Sklearn);

        let err = config.endpoint("nope").unwrap_err().to_string();
        assert!(err.contains("digits/2"));
    }

    #[test]
    fn test_missing_file() {
        assert!(DeploymentConfig::from_file(Path::new("/does/not/exist.yaml")).is_err());
    }
}
