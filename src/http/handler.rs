//! Main axum router and HTTP request handlers for the gateway.
//!
//! Routes:
//! - `ANY  {base}/{*path}` - Authorise the caller and forward the body to the backend
//! - `GET  /healthz`       - Health check
//! - `GET  /metrics`       - Prometheus metrics

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::RequestOutcome;
use crate::rpc::{ForwardRequest, RpcError, DEFAULT_CONTENT_TYPE};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let base = state.config.server.base_path();

    let mut router = Router::new()
        .route(&format!("{base}/"), any(handle_forward))
        .route(&format!("{base}/{{*path}}"), any(handle_forward));
    if !base.is_empty() {
        router = router.route(&base, any(handle_forward));
    }

    router
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `ANY {base}/...`
///
/// Resolves the caller against the registry and, once authorised, forwards
/// the request body to the backend.  Every request ends in exactly one of
/// the [`RequestOutcome`] states.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_forward(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, GatewayError> {
    let result = forward(&state, request).await;
    let outcome = match &result {
        Ok(_) => RequestOutcome::Completed,
        Err(e) => e.outcome(),
    };
    state.metrics.metrics.record_request(outcome);
    result
}

async fn forward(state: &AppState, request: Request) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();

    // 1. Who is calling?
    let identity = state
        .identity
        .extract(&parts)
        .ok_or(GatewayError::MissingIdentity)?;

    // 2. Are they registered?  No backend call is made otherwise.
    let (token, record) = state
        .store
        .lookup_any(identity.candidates.iter().map(String::as_str))
        .ok_or_else(|| GatewayError::UnknownIdentity {
            subject: identity.subject.clone(),
        })?;
    let token = token.to_string();
    debug!(subject = %identity.subject, %token, id = record.id, "caller authorised");

    // 3. Read the body within the configured bound.
    let limit = state.config.server.max_body_bytes;
    let body = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| GatewayError::BodyTooLarge { limit })?;

    // 4. Forward.
    let started = Instant::now();
    let result = state
        .backend
        .call(ForwardRequest {
            identifier: record.id,
            token: token.clone(),
            body,
        })
        .await;
    state.metrics.metrics.observe_upstream(started.elapsed());
    let response = result.map_err(GatewayError::Upstream)?;

    info!(
        id = record.id,
        %token,
        payload_len = response.payload.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request forwarded"
    );
    let content_type = HeaderValue::from_str(&response.content_type).unwrap_or_else(|_| {
        warn!(content_type = ?response.content_type, "replacing invalid backend content type");
        HeaderValue::from_static(DEFAULT_CONTENT_TYPE)
    });
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        Body::from(response.payload),
    )
        .into_response())
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the gateway.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(buf) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Request-scoped failures, each mapped to one HTTP status.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No client certificate or identity header was presented.
    #[error("no client identity presented")]
    MissingIdentity,
    /// The presented identity is not in the registry.
    #[error("identity {subject} is not registered")]
    UnknownIdentity { subject: String },
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error(transparent)]
    Upstream(#[from] RpcError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingIdentity => StatusCode::UNAUTHORIZED,
            GatewayError::UnknownIdentity { .. } => StatusCode::FORBIDDEN,
            GatewayError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Upstream(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn outcome(&self) -> RequestOutcome {
        match self {
            GatewayError::Upstream(_) => RequestOutcome::UpstreamFailed,
            _ => RequestOutcome::Rejected,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            GatewayError::Upstream(e) => error!(error = %e, %status, "backend call failed"),
            e => warn!(error = %e, %status, "request rejected"),
        }
        (status, self.to_string()).into_response()
    }
}
