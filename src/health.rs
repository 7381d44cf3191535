use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::store::Generation;
use crate::registry::KeyMode;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub registry: RegistryHealth,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct RegistryHealth {
    pub key_mode: KeyMode,
    pub version: u64,
    pub records: usize,
    pub index_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_install: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub loaded: CheckResult,
    pub fresh: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

fn check_loaded(generation: &Generation) -> CheckResult {
    if generation.is_loaded() {
        CheckResult::healthy()
    } else {
        CheckResult::unhealthy("registry has never been loaded")
    }
}

/// A generation older than two refresh intervals means refreshes keep
/// failing; the previous records are still served.
fn check_fresh(age_secs: Option<i64>, interval_secs: u64) -> CheckResult {
    let limit = interval_secs.saturating_mul(2);
    match age_secs {
        Some(age) if age > limit as i64 => {
            CheckResult::unhealthy(format!("last install {age}s ago, expected within {limit}s"))
        }
        _ => CheckResult::healthy(),
    }
}

fn seconds_since(loaded_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    loaded_at.map(|at| (now - at).num_seconds().max(0))
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.loaded.ok {
        HealthStatus::Unhealthy
    } else if !checks.fresh.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

pub fn build_response(
    generation: &Generation,
    key_mode: KeyMode,
    interval_secs: u64,
    now: DateTime<Utc>,
) -> HealthResponse {
    let age = seconds_since(generation.loaded_at, now);
    let checks = HealthChecks {
        loaded: check_loaded(generation),
        fresh: check_fresh(age, interval_secs),
    };
    HealthResponse {
        status: aggregate_status(&checks),
        registry: RegistryHealth {
            key_mode,
            version: generation.version,
            records: generation.snapshot.len(),
            index_tokens: generation.index.len(),
            source: generation.source.clone(),
            seconds_since_install: age,
        },
        checks,
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let generation = state.store.generation();
    let interval = state.config.registry.refresh_interval().as_secs();
    let body = build_response(&generation, state.store.key_mode(), interval, Utc::now());

    let http_status = match body.status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use tower::ServiceExt;

    use super::*;
    use crate::http::handler::create_router;
    use crate::registry::CacheStore;
    use crate::test_support::{loaded_store, test_state, MockBackend};

    async fn get_health(store: CacheStore) -> (StatusCode, serde_json::Value) {
        let app = create_router(test_state(store, MockBackend::echo()));
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_never_loaded_is_503() {
        let (status, body) = get_health(CacheStore::new(KeyMode::Dn)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["registry"]["version"], 0);
        assert!(body["registry"].get("seconds_since_install").is_none());
    }

    #[tokio::test]
    async fn test_loaded_registry_is_ok() {
        let (status, body) = get_health(loaded_store()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["registry"]["version"], 1);
        assert_eq!(body["registry"]["records"], 2);
        assert_eq!(body["registry"]["key_mode"], "dn");
        assert_eq!(body["registry"]["source"], "registry.json");
    }

    #[test]
    fn test_stale_registry_is_degraded() {
        let store = loaded_store();
        let generation = store.generation();
        let loaded_at = generation.loaded_at.unwrap();

        let response = build_response(&generation, KeyMode::Dn, 3600, loaded_at + Duration::hours(3));
        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.registry.seconds_since_install, Some(3 * 3600));

        let response = build_response(&generation, KeyMode::Dn, 3600, loaded_at + Duration::hours(1));
        assert_eq!(response.status, HealthStatus::Ok);
    }
}
