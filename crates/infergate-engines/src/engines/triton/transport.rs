//! Wire transport to the remote inference server

use super::proto::grpc_inference_service_client::GrpcInferenceServiceClient;
use super::proto::{ModelInferRequest, ModelInferResponse};
use async_trait::async_trait;
use infergate_core::{Error, Result};
use std::time::Duration;
use tonic::codec::CompressionEncoding;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::debug;

/// Sends one inference request and waits for its response
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    async fn model_infer(
        &self,
        request: ModelInferRequest,
        timeout: Duration,
    ) -> Result<ModelInferResponse>;
}

/// Address with an `http://` scheme tonic can dial
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if let Some(rest) = address.strip_prefix("grpc://") {
        format!("http://{}", rest)
    } else if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Parse an address into a tonic endpoint
pub fn parse_endpoint(address: &str) -> Result<Endpoint> {
    Endpoint::from_shared(normalize_address(address)).map_err(|e| {
        Error::config(format!(
            "external inference server misconfigured [{}]: {}",
            address, e
        ))
    })
}

/// gRPC transport over a lazily connected tonic channel
#[derive(Clone)]
pub struct GrpcTransport {
    address: String,
    client: GrpcInferenceServiceClient<Channel>,
}

impl GrpcTransport {
    /// Prepare a channel; nothing is dialled until the first call
    pub fn connect_lazy(address: &str) -> Result<Self> {
        let channel = parse_endpoint(address)?
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(10))
            .connect_lazy();

        let client = GrpcInferenceServiceClient::new(channel)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip);

        debug!("Prepared gRPC channel to {}", address);
        Ok(Self {
            address: address.to_string(),
            client,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn status_error(&self, status: tonic::Status, timeout: Duration) -> Error {
        match status.code() {
            Code::DeadlineExceeded => Error::Timeout(timeout),
            Code::Unavailable => Error::config(format!(
                "inference server at {} is unreachable: {}",
                self.address,
                status.message()
            )),
            code => Error::Remote {
                code: format!("{:?}", code),
                message: status.message().to_string(),
            },
        }
    }
}

#[async_trait]
impl InferenceTransport for GrpcTransport {
    async fn model_infer(
        &self,
        request: ModelInferRequest,
        timeout: Duration,
    ) -> Result<ModelInferResponse> {
        let mut client = self.client.clone();
        let mut request = tonic::Request::new(request);
        request.set_timeout(timeout);

        let response = client
            .model_infer(request)
            .await
            .map_err(|status| self.status_error(status, timeout))?;

        Ok(response.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("127.0.0.1:8001"), "http://127.0.0.1:8001");
        assert_eq!(normalize_address("grpc://triton:8001"), "http://triton:8001");
        assert_eq!(normalize_address("https://triton:443"), "https://triton:443");
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(parse_endpoint("not a host:80"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let transport = GrpcTransport::connect_lazy("127.0.0.1:8001").unwrap();
        let timeout = Duration::from_secs(3);

        assert!(transport
            .status_error(tonic::Status::deadline_exceeded("slow"), timeout)
            .is_timeout());
        assert!(matches!(
            transport.status_error(tonic::Status::unavailable("down"), timeout),
            Error::Config(_)
        ));
        match transport.status_error(tonic::Status::not_found("no model"), timeout) {
            Error::Remote { code, message } => {
                assert_eq!(code, "NotFound");
                assert_eq!(message, "no model");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
