//! Fully user-defined processing

use crate::engine::{Engine, EngineContext, EngineFuture};
use crate::plugin::Plugin;
use async_trait::async_trait;
use infergate_core::{EngineKind, Payload, Result, StatsSink};
use std::sync::Arc;
use tracing::trace;

/// Engine that only runs the plugin's `process` hook
pub struct CustomEngine {
    plugin: Option<Arc<dyn Plugin>>,
}

impl CustomEngine {
    pub fn new(ctx: &EngineContext) -> Self {
        Self {
            plugin: ctx.process_override(),
        }
    }

    pub fn construct(ctx: EngineContext) -> EngineFuture {
        Box::pin(async move { Ok(Arc::new(Self::new(&ctx)) as Arc<dyn Engine>) })
    }
}

#[async_trait]
impl Engine for CustomEngine {
    async fn process(&self, data: Payload, stats: &StatsSink) -> Result<Payload> {
        match &self.plugin {
            Some(plugin) => plugin.process(data, stats).await,
            None => {
                trace!("No process hook, returning empty result");
                Ok(Payload::Empty)
            }
        }
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Custom
    }
}
