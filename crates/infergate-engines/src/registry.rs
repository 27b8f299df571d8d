//! Engine registry
//!
//! Maps engine names to constructors. The built-in table is an ordered
//! static list; embedders can add their own engines or replace a built-in
//! one before constructing dispatchers.

use crate::engine::{EngineConstructor, EngineContext, EngineFuture};
use crate::engines::{custom, scoring, triton};
use infergate_core::{Error, Result};
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// A named prerequisite check declared by an engine
#[derive(Debug, Clone, Copy)]
pub struct ModuleCheck {
    pub name: &'static str,
    pub check: fn() -> Result<()>,
}

/// One registered engine
#[derive(Clone)]
pub struct EngineRegistration {
    pub name: String,
    pub constructor: EngineConstructor,
    pub modules: &'static [ModuleCheck],
}

/// Registry of engine constructors in registration order
pub struct EngineRegistry {
    entries: RwLock<Vec<EngineRegistration>>,
}

static GLOBAL: OnceLock<Arc<EngineRegistry>> = OnceLock::new();

static TRITON_MODULES: &[ModuleCheck] = &[ModuleCheck {
    name: "grpc",
    check: triton::check_grpc,
}];

impl EngineRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Registry holding the built-in engines
    pub fn builtin() -> Self {
        let registry = Self::new();
        registry.register("triton", triton::TritonEngine::construct, TRITON_MODULES);
        registry.register("sklearn", scoring::construct_sklearn, &[]);
        registry.register("xgboost", scoring::construct_xgboost, &[]);
        registry.register("lightgbm", scoring::construct_lightgbm, &[]);
        registry.register("custom", custom::CustomEngine::construct, &[]);
        registry
    }

    /// Process-wide registry, built on first use
    ///
    /// Serving contexts use it unless given a registry of their own.
    pub fn global() -> Arc<EngineRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::builtin())))
    }

    /// Register an engine; an existing name keeps its position
    pub fn register<F>(
        &self,
        name: impl Into<String>,
        constructor: F,
        modules: &'static [ModuleCheck],
    ) where
        F: Fn(EngineContext) -> EngineFuture + Send + Sync + 'static,
    {
        let name = name.into().to_ascii_lowercase();
        let registration = EngineRegistration {
            name: name.clone(),
            constructor: Arc::new(constructor),
            modules,
        };

        let mut entries = self.entries.write();
        match entries.iter_mut().find(|entry| entry.name == name) {
            Some(existing) => {
                debug!("Replacing engine '{}'", name);
                *existing = registration;
            }
            None => {
                debug!("Registered engine '{}'", name);
                entries.push(registration);
            }
        }
    }

    /// Constructor registered for `name`
    pub fn resolve(&self, name: &str) -> Result<EngineConstructor> {
        let name = name.to_ascii_lowercase();
        self.entries
            .read()
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| Arc::clone(&entry.constructor))
            .ok_or_else(|| Error::config(format!("unknown engine '{}'", name)))
    }

    pub fn is_supported(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.entries.read().iter().any(|entry| entry.name == name)
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|entry| entry.name.clone()).collect()
    }

    /// Run every declared check, returning the names that passed
    ///
    /// Failures are logged and skipped.
    pub fn load_modules(&self) -> Vec<&'static str> {
        let entries = self.entries.read().clone();
        let mut loaded = Vec::new();

        for entry in &entries {
            for module in entry.modules {
                match (module.check)() {
                    Ok(()) => loaded.push(module.name),
                    Err(e) => debug!(
                        "Module '{}' for engine '{}' unavailable: {}",
                        module.name, entry.name, e
                    ),
                }
            }
        }

        info!("Loaded {} engine modules", loaded.len());
        loaded
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::custom::CustomEngine;

    fn failing_check() -> Result<()> {
        Err(Error::config("not installed"))
    }

    fn passing_check() -> Result<()> {
        Ok(())
    }

    static MIXED: &[ModuleCheck] = &[
        ModuleCheck {
            name: "missing",
            check: failing_check,
        },
        ModuleCheck {
            name: "present",
            check: passing_check,
        },
    ];

    #[test]
    fn test_builtin_order() {
        let registry = EngineRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["triton", "sklearn", "xgboost", "lightgbm", "custom"]
        );
    }

    #[test]
    fn test_resolve_iff_supported() {
        let registry = EngineRegistry::builtin();
        for name in ["triton", "sklearn", "XGBoost", "lightgbm", "custom", "onnx", ""] {
            assert_eq!(registry.resolve(name).is_ok(), registry.is_supported(name), "{name}");
        }
        assert!(!registry.is_supported("onnx"));
        assert!(matches!(registry.resolve("onnx"), Err(Error::Config(_))));
    }

    #[test]
    fn test_reregister_keeps_position() {
        let registry = EngineRegistry::builtin();
        registry.register("sklearn", CustomEngine::construct, &[]);
        registry.register("onnx", CustomEngine::construct, &[]);
        assert_eq!(
            registry.names(),
            vec!["triton", "sklearn", "xgboost", "lightgbm", "custom", "onnx"]
        );
    }

    #[test]
    fn test_load_modules_swallows_failures() {
        let registry = EngineRegistry::new();
        registry.register("custom", CustomEngine::construct, MIXED);
        assert_eq!(registry.load_modules(), vec!["present"]);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&EngineRegistry::global(), &EngineRegistry::global()));
        assert!(EngineRegistry::global().is_supported("triton"));
    }
}
