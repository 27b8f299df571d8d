//! Remote tensor inference server backend
//!
//! Marshals request data into a single typed input tensor, calls
//! `ModelInfer` over gRPC and decodes the returned buffers.

pub mod codec;
pub mod proto;
pub mod transport;

pub use transport::{GrpcTransport, InferenceTransport};

use crate::engine::{Engine, EngineContext, EngineFuture};
use crate::plugin::Plugin;
use async_trait::async_trait;
use infergate_core::{
    ElementType, EndpointConfig, EngineKind, Error, Payload, Result, StatsSink,
    DEFAULT_TRITON_GRPC_SERVER,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Input and output tensor settings, resolved from the endpoint
#[derive(Debug, Clone)]
struct TensorIo {
    input_name: String,
    input_type: ElementType,
    input_size: Option<Vec<i64>>,
    output_name: String,
    output_type: ElementType,
}

impl TensorIo {
    fn from_endpoint(endpoint: &EndpointConfig) -> Result<Self> {
        let missing = |field: &str| {
            Error::config(format!(
                "endpoint '{}' is missing `{}` for the triton engine",
                endpoint.endpoint_path(),
                field
            ))
        };

        Ok(Self {
            input_name: endpoint.input_name.clone().ok_or_else(|| missing("input_name"))?,
            input_type: endpoint.input_type.ok_or_else(|| missing("input_type"))?,
            input_size: endpoint.input_size.clone(),
            output_name: endpoint.output_name.clone().ok_or_else(|| missing("output_name"))?,
            output_type: endpoint.output_type.ok_or_else(|| missing("output_type"))?,
        })
    }
}

/// Engine forwarding requests to a KServe v2 gRPC inference server
pub struct TritonEngine {
    model_name: String,
    io: Option<TensorIo>,
    plugin: Option<Arc<dyn Plugin>>,
    transport: Arc<dyn InferenceTransport>,
    timeout: Duration,
}

impl TritonEngine {
    /// Engine talking to the configured server over gRPC
    pub fn new(ctx: &EngineContext) -> Result<Self> {
        let transport = GrpcTransport::connect_lazy(ctx.serving.triton_grpc_server())?;
        Self::with_transport(ctx, Arc::new(transport))
    }

    /// Engine using an arbitrary transport
    pub fn with_transport(
        ctx: &EngineContext,
        transport: Arc<dyn InferenceTransport>,
    ) -> Result<Self> {
        let plugin = ctx.process_override();

        // a plugin `process` hook replaces marshalling entirely
        let io = match plugin {
            Some(_) => TensorIo::from_endpoint(&ctx.endpoint).ok(),
            None => Some(TensorIo::from_endpoint(&ctx.endpoint)?),
        };

        Ok(Self {
            model_name: ctx.endpoint.endpoint_path(),
            io,
            plugin,
            transport,
            timeout: ctx.serving.request_timeout(),
        })
    }

    /// Registry constructor
    pub fn construct(ctx: EngineContext) -> EngineFuture {
        Box::pin(async move { Ok(Arc::new(Self::new(&ctx)?) as Arc<dyn Engine>) })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn infer(&self, io: &TensorIo, data: Payload) -> Result<Payload> {
        trace!("[{}] channel opened", self.model_name);

        let input = codec::encode_input(
            &io.input_name,
            io.input_type,
            io.input_size.as_deref(),
            &data,
        )?;
        let request = codec::build_request(self.model_name.clone(), input, &io.output_name);
        trace!("[{}] request built", self.model_name);

        let call = self.transport.model_infer(request, self.timeout);
        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;
        trace!("[{}] response received ({} outputs)", self.model_name, response.outputs.len());

        let decoded = codec::decode_response(&response, io.output_type)?;
        debug!("[{}] response decoded", self.model_name);
        Ok(decoded)
    }
}

#[async_trait]
impl Engine for TritonEngine {
    async fn process(&self, data: Payload, stats: &StatsSink) -> Result<Payload> {
        if let Some(plugin) = &self.plugin {
            return plugin.process(data, stats).await;
        }

        let io = self
            .io
            .as_ref()
            .ok_or_else(|| Error::internal("triton engine has no tensor configuration"))?;
        self.infer(io, data).await
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Triton
    }
}

/// Default server address must parse as a gRPC endpoint
pub fn check_grpc() -> Result<()> {
    transport::parse_endpoint(DEFAULT_TRITON_GRPC_SERVER).map(|_| ())
}
