//! Served endpoint descriptors

use crate::error::{Error, Result};
use crate::tensor::ElementType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backend engine variant an endpoint is served by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EngineKind {
    /// Remote tensor inference server over gRPC
    Triton,
    /// Linear estimators exported from scikit-learn
    Sklearn,
    /// XGBoost JSON boosters
    XgBoost,
    /// LightGBM text boosters
    LightGbm,
    /// Fully user-defined processing
    Custom,
    /// Engine registered by an embedder
    Other(String),
}

impl EngineKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Triton => "triton",
            Self::Sklearn => "sklearn",
            Self::XgBoost => "xgboost",
            Self::LightGbm => "lightgbm",
            Self::Custom => "custom",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EngineKind {
    fn from(name: String) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "triton" => Self::Triton,
            "sklearn" => Self::Sklearn,
            "xgboost" => Self::XgBoost,
            "lightgbm" => Self::LightGbm,
            "custom" => Self::Custom,
            _ => Self::Other(name),
        }
    }
}

impl From<&str> for EngineKind {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<EngineKind> for String {
    fn from(kind: EngineKind) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for EngineKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

/// Immutable description of one served model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Backend engine
    pub engine: EngineKind,

    /// Serving path, e.g. `mnist/classify`
    pub serving_url: String,

    /// Endpoint version; empty for unversioned endpoints
    #[serde(default)]
    pub version: String,

    /// Model registry identifier
    #[serde(default)]
    pub model_id: Option<String>,

    /// Name of the preprocessing code artifact
    #[serde(default)]
    pub preprocess_artifact: Option<String>,

    #[serde(default)]
    pub input_name: Option<String>,

    #[serde(default)]
    pub input_type: Option<ElementType>,

    #[serde(default)]
    pub input_size: Option<Vec<i64>>,

    #[serde(default)]
    pub output_name: Option<String>,

    #[serde(default)]
    pub output_type: Option<ElementType>,

    /// Informational only; responses are reshaped with the server's shape
    #[serde(default)]
    pub output_size: Option<Vec<i64>>,
}

impl EndpointConfig {
    /// Minimal endpoint for an engine and serving path
    pub fn new(engine: impl Into<EngineKind>, serving_url: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            serving_url: serving_url.into(),
            version: String::new(),
            model_id: None,
            preprocess_artifact: None,
            input_name: None,
            input_type: None,
            input_size: None,
            output_name: None,
            output_type: None,
            output_size: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_preprocess_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.preprocess_artifact = Some(artifact.into());
        self
    }

    /// Configure the single input tensor
    pub fn with_input(
        mut self,
        name: impl Into<String>,
        element_type: ElementType,
        size: Vec<i64>,
    ) -> Self {
        self.input_name = Some(name.into());
        self.input_type = Some(element_type);
        self.input_size = Some(size);
        self
    }

    /// Configure the requested output tensor
    pub fn with_output(mut self, name: impl Into<String>, element_type: ElementType) -> Self {
        self.output_name = Some(name.into());
        self.output_type = Some(element_type);
        self
    }

    /// `serving_url/version` with surrounding slashes removed
    pub fn endpoint_path(&self) -> String {
        format!("{}/{}", self.serving_url, self.version)
            .trim_matches('/')
            .to_string()
    }

    /// Model id, or a configuration error naming the endpoint
    pub fn require_model_id(&self) -> Result<&str> {
        self.model_id.as_deref().ok_or_else(|| {
            Error::config(format!(
                "endpoint '{}' has no model id configured",
                self.endpoint_path()
            ))
        })
    }
}
