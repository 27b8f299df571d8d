//! InferGate Engines
//!
//! Request dispatch for served model endpoints.
//!
//! An endpoint is served by one backend engine, optionally wrapped by a
//! preprocessing plugin:
//! - `triton`: remote tensor inference server over gRPC
//! - `sklearn`, `xgboost`, `lightgbm`: in-process scoring of exported models
//! - `custom`: the plugin does all the work
//!
//! A [`Dispatcher`] is built once per endpoint and runs every request
//! through preprocess, process and postprocess.

pub mod dispatcher;
pub mod engine;
pub mod engines;
pub mod plugin;
pub mod registry;

pub use dispatcher::{Dispatcher, ServingContext, ServingContextBuilder};
pub use engine::{Engine, EngineConstructor, EngineContext, EngineFuture, Model, ModelHandle};
pub use engines::{CustomEngine, ScoringEngine, TritonEngine};
pub use plugin::{
    Capabilities, GatewayClient, LoadedPlugin, NestedRequest, Plugin, PluginHost, PluginLoader,
    WasmPluginLoader,
};
pub use registry::{EngineRegistration, EngineRegistry, ModuleCheck};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::dispatcher::{Dispatcher, ServingContext};
    pub use crate::engine::{Engine, Model, ModelHandle};
    pub use crate::plugin::{Capabilities, Plugin, PluginLoader};
    pub use crate::registry::EngineRegistry;
    pub use infergate_core::prelude::*;
}
