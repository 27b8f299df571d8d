//! Artifact and model storage collaborators
//!
//! The dispatch core only needs two things from storage: the local path of
//! a named artifact (with its recorded content hash), and the local path of
//! a model by id. The filesystem stores here back both with plain
//! directories; remote stores implement the same traits.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source of preprocessing code artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether the store knows this artifact
    fn contains(&self, name: &str) -> bool;

    /// Local path of the artifact, fetching it when missing or when forced
    async fn local_path(
        &self,
        name: &str,
        force_download: bool,
        extract_archive: bool,
    ) -> Result<PathBuf>;

    /// Content hash recorded when the artifact was registered
    async fn expected_hash(&self, name: &str) -> Result<Option<String>>;
}

/// Source of model weight files
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Local path of the model with this id
    async fn local_model_path(&self, model_id: &str) -> Result<PathBuf>;
}

/// Lowercase hex SHA-256 of a file's contents
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// One registered artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Where the artifact is fetched from
    pub source: PathBuf,

    /// SHA-256 recorded at registration time
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Artifact store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactStoreConfig {
    /// Local cache directory; defaults to the user cache dir
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub artifacts: HashMap<String, ArtifactEntry>,
}

/// Artifact store that copies registered files into a local cache
pub struct FsArtifactStore {
    cache_dir: PathBuf,
    entries: HashMap<String, ArtifactEntry>,
}

impl FsArtifactStore {
    /// Create an empty store caching into `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            entries: HashMap::new(),
        }
    }

    /// Create a store from configuration
    pub fn from_config(config: &ArtifactStoreConfig) -> Self {
        let cache_dir = config.cache_dir.clone().unwrap_or_else(default_cache_dir);
        Self {
            cache_dir,
            entries: config.artifacts.clone(),
        }
    }

    /// Register an artifact
    pub fn with_artifact(mut self, name: impl Into<String>, entry: ArtifactEntry) -> Self {
        self.entries.insert(name.into(), entry);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry(&self, name: &str) -> Result<&ArtifactEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::config(format!("artifact '{}' is not registered", name)))
    }

    fn cached_path(&self, name: &str, entry: &ArtifactEntry) -> PathBuf {
        let file_name = entry
            .source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| name.into());
        self.cache_dir.join(name).join(file_name)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("infergate/artifacts")
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    async fn local_path(
        &self,
        name: &str,
        force_download: bool,
        extract_archive: bool,
    ) -> Result<PathBuf> {
        let entry = self.entry(name)?;
        let cached = self.cached_path(name, entry);

        if !force_download && tokio::fs::try_exists(&cached).await.unwrap_or(false) {
            debug!("Using cached artifact '{}' at {}", name, cached.display());
            return Ok(cached);
        }

        if let Some(parent) = cached.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&entry.source, &cached).await.map_err(|e| {
            Error::config(format!(
                "failed fetching artifact '{}' from {}: {}",
                name,
                entry.source.display(),
                e
            ))
        })?;

        // single-file artifacts; nothing to unpack
        if extract_archive {
            debug!("Artifact '{}' is a plain file, skipping extraction", name);
        }

        info!("Fetched artifact '{}' into {}", name, cached.display());
        Ok(cached)
    }

    async fn expected_hash(&self, name: &str) -> Result<Option<String>> {
        Ok(self.entry(name)?.sha256.clone())
    }
}

/// Model store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelStoreConfig {
    /// Directory holding `<model_id>` files
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Explicit id to path mapping, checked first
    #[serde(default)]
    pub models: HashMap<String, PathBuf>,
}

/// Model store resolving ids against a directory
#[derive(Debug, Clone, Default)]
pub struct FsModelStore {
    config: ModelStoreConfig,
}

impl FsModelStore {
    pub fn new(config: ModelStoreConfig) -> Self {
        Self { config }
    }

    /// Store resolving every id under `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self::new(ModelStoreConfig {
            root: Some(root.into()),
            models: HashMap::new(),
        })
    }

    /// Register an explicit model path
    pub fn with_model(mut self, model_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.config.models.insert(model_id.into(), path.into());
        self
    }
}

#[async_trait]
impl ModelStore for FsModelStore {
    async fn local_model_path(&self, model_id: &str) -> Result<PathBuf> {
        let path = match self.config.models.get(model_id) {
            Some(path) => path.clone(),
            None => match &self.config.root {
                Some(root) => root.join(model_id),
                None => {
                    return Err(Error::config(format!("model '{}' is not registered", model_id)))
                }
            },
        };

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::config(format!(
                "model '{}' not found at {}",
                model_id,
                path.display()
            )));
        }
        Ok(path)
    }
}
