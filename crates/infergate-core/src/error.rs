//! Error types for InferGate

use std::fmt;
use std::time::Duration;

/// Result type alias using InferGate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage a request failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preprocess,
    Process,
    Postprocess,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::Process => "process",
            Self::Postprocess => "postprocess",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for InferGate operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing artifacts, unknown engines, unreachable or misconfigured servers
    #[error("configuration error: {0}")]
    Config(String),

    /// Preprocessing code could not be fetched, compiled or instantiated
    #[error("failed loading preprocess code for '{artifact}': {source}")]
    Load {
        artifact: String,
        #[source]
        source: Box<Error>,
    },

    /// A plugin call failed inside user code
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Element type has no wire representation
    #[error("unsupported element type: {0}")]
    UnsupportedType(String),

    /// Data could not be coerced into the requested shape or type
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Model file could not be parsed or evaluated
    #[error("model error: {0}")]
    Model(String),

    /// The remote inference server answered with a non-success status
    #[error("remote inference error ({code}): {message}")]
    Remote { code: String, message: String },

    /// Remote call exceeded the request timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A pipeline stage failed for a single request
    #[error("{stage} failed: {source}")]
    Request {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    /// Filesystem errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration errors
    #[error("yaml error: {0}")]
    Yaml(String),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap an error raised while loading a preprocessing artifact
    pub fn load(artifact: impl Into<String>, source: Error) -> Self {
        Self::Load {
            artifact: artifact.into(),
            source: Box::new(source),
        }
    }

    /// Create a new plugin error
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    /// Create a new unsupported-type error
    pub fn unsupported_type(msg: impl Into<String>) -> Self {
        Self::UnsupportedType(msg.into())
    }

    /// Create a new invalid-payload error
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Create a new model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap a stage failure as a request error
    pub fn request(stage: Stage, source: Error) -> Self {
        Self::Request {
            stage,
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through request and load wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Request { source, .. } | Self::Load { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether this error was caused by a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout(_))
    }

    /// Whether this error is confined to a single request
    pub fn is_request_error(&self) -> bool {
        matches!(self, Self::Request { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml(err.to_string())
    }
}
