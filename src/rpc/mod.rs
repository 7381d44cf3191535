//! Backend compute service client.
//!
//! The gateway talks to the backend through the [`Backend`] trait so the
//! forwarding path can be exercised without a live gRPC server.
//! [`GrpcBackend`] is the production implementation: one lazily connected
//! `tonic` channel, plaintext or TLS, with a fixed per-call deadline and no
//! retries.

pub mod proto;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use axum::http::HeaderValue;
use bytes::Bytes;
use thiserror::Error;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, instrument, warn};

use crate::config::BackendConfig;
use proto::DataServiceClient;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    /// Primary identifier of the authorised identity.
    pub identifier: i64,
    /// Token the caller was authorised with.
    pub token: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResponse {
    pub payload: Bytes,
    pub content_type: String,
}

impl From<ForwardRequest> for proto::Request {
    fn from(req: ForwardRequest) -> Self {
        proto::Request {
            data: Some(proto::Data {
                id: req.identifier,
                token: req.token,
                body: req.body.to_vec(),
            }),
        }
    }
}

impl From<proto::Response> for ForwardResponse {
    /// An empty or unusable `content_type` is replaced by
    /// [`DEFAULT_CONTENT_TYPE`]; the payload is kept as is.
    fn from(resp: proto::Response) -> Self {
        let content_type = if resp.content_type.is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else if HeaderValue::from_str(&resp.content_type).is_err() {
            warn!(content_type = ?resp.content_type, "backend content type is not a valid header value");
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            resp.content_type
        };
        ForwardResponse {
            payload: Bytes::from(resp.payload),
            content_type,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("backend call exceeded {0:?} deadline")]
    Timeout(Duration),
    #[error("backend transport failure: {0}")]
    Transport(String),
    #[error("backend returned {code:?}: {message}")]
    Status { code: tonic::Code, message: String },
    #[error("invalid backend address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("backend TLS setup failed: {0}")]
    Tls(String),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable => RpcError::Transport(status.message().to_string()),
            code => RpcError::Status {
                code,
                message: status.message().to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Issue one unary call.  Implementations never retry.
    async fn call(&self, request: ForwardRequest) -> Result<ForwardResponse, RpcError>;
}

/// Await `call`, giving up once `deadline` has elapsed.
///
/// A `DeadlineExceeded` status, or the `Cancelled` status tonic reports when
/// its own request timer fires, is classified as a timeout as well.
pub async fn call_with_deadline<F, T>(deadline: Duration, call: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, tonic::Status>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(status)) if is_deadline_status(&status) => Err(RpcError::Timeout(deadline)),
        Ok(Err(status)) => Err(status.into()),
        Err(_) => Err(RpcError::Timeout(deadline)),
    }
}

fn is_deadline_status(status: &tonic::Status) -> bool {
    match status.code() {
        tonic::Code::DeadlineExceeded => true,
        tonic::Code::Cancelled => status.message() == TONIC_TIMEOUT_MESSAGE,
        _ => false,
    }
}

/// Message tonic attaches to `Cancelled` when a transport timeout elapses.
const TONIC_TIMEOUT_MESSAGE: &str = "Timeout expired";

// ---------------------------------------------------------------------------
// gRPC implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GrpcBackend {
    client: DataServiceClient,
    timeout: Duration,
    address: String,
}

impl GrpcBackend {
    /// Build the channel described by `config`.  The connection itself is
    /// established lazily on the first call.
    pub fn from_config(config: &BackendConfig) -> Result<Self, RpcError> {
        let tls = config.client_cert.is_some();
        let address = backend_uri(&config.address, tls);
        let invalid = |reason: String| RpcError::InvalidAddress {
            address: address.clone(),
            reason,
        };

        let mut endpoint = Endpoint::from_shared(address.clone())
            .map_err(|e| invalid(e.to_string()))?
            .connect_timeout(config.connect_timeout());

        if tls {
            endpoint = endpoint
                .tls_config(client_tls_config(config)?)
                .map_err(|e| RpcError::Tls(e.to_string()))?;
        }

        let channel: Channel = endpoint.connect_lazy();
        info!(%address, tls, timeout_secs = config.timeout_secs, "backend channel configured");

        Ok(Self {
            client: DataServiceClient::new(channel),
            timeout: config.timeout(),
            address,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait::async_trait]
impl Backend for GrpcBackend {
    #[instrument(skip(self, request), fields(identifier = request.identifier, body_len = request.body.len()))]
    async fn call(&self, request: ForwardRequest) -> Result<ForwardResponse, RpcError> {
        let mut client = self.client.clone();
        let mut grpc_request = tonic::Request::new(proto::Request::from(request));
        grpc_request.set_timeout(self.timeout);

        let response = call_with_deadline(self.timeout, client.get_data(grpc_request)).await?;
        let response = ForwardResponse::from(response.into_inner());
        debug!(payload_len = response.payload.len(), "backend call completed");
        Ok(response)
    }
}

/// Add a scheme to bare `host:port` addresses and force `https` for TLS.
fn backend_uri(address: &str, tls: bool) -> String {
    let address = address.trim();
    match address.split_once("://") {
        None if tls => format!("https://{address}"),
        None => format!("http://{address}"),
        Some(("http", rest)) if tls => {
            warn!(%address, "client certificate configured, using https for backend");
            format!("https://{rest}")
        }
        Some(_) => address.to_string(),
    }
}

fn client_tls_config(config: &BackendConfig) -> Result<ClientTlsConfig, RpcError> {
    let mut tls = ClientTlsConfig::new();
    tls = match &config.ca_cert {
        Some(ca) => tls.ca_certificate(Certificate::from_pem(read_pem(ca)?)),
        None => tls.with_native_roots(),
    };
    if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
        tls = tls.identity(Identity::from_pem(read_pem(cert)?, read_pem(key)?));
    }
    Ok(tls)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, RpcError> {
    std::fs::read(path).map_err(|e| RpcError::Tls(format!("{}: {e}", path.display())))
}
