//! InferGate Core
//!
//! Core types, traits, and utilities shared across InferGate components.
//!
//! This crate provides:
//! - The error type and result alias
//! - Endpoint descriptors and engine kinds
//! - Element types, typed arrays, and the payload passed between pipeline stages
//! - The statistics sink handed to plugin code
//! - Serving configuration (outbound timeouts, server addresses)
//! - Artifact and model storage collaborators

pub mod artifact;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod stats;
pub mod tensor;

pub use artifact::{
    sha256_file, ArtifactEntry, ArtifactStore, ArtifactStoreConfig, FsArtifactStore, FsModelStore,
    ModelStore, ModelStoreConfig,
};
pub use config::{ServingConfig, DEFAULT_BASE_SERVING_URL, DEFAULT_TRITON_GRPC_SERVER};
pub use endpoint::{EndpointConfig, EngineKind};
pub use error::{Error, Result, Stage};
pub use stats::{StatsMap, StatsSink};
pub use tensor::{ElementType, Payload, Scalar, TensorData};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::endpoint::{EndpointConfig, EngineKind};
    pub use crate::error::{Error, Result, Stage};
    pub use crate::stats::StatsSink;
    pub use crate::tensor::{ElementType, Payload, TensorData};
}
