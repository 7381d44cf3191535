//! Shared fixtures for router-level tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::config::Config;
use crate::http::identity::HeaderIdentity;
use crate::metrics::MetricsRegistry;
use crate::registry::test_support::{record, snapshot_by_id};
use crate::registry::{CacheStore, KeyMode};
use crate::rpc::{call_with_deadline, Backend, ForwardRequest, ForwardResponse, RpcError};
use crate::AppState;

/// Identity header trusted by the fixture config.
pub const DN_HEADER: &str = "X-Ssl-Client-S-Dn";

pub const JOHN_DN: &str =
    "/DC=ch/DC=cern/OU=Organic Units/OU=Users/CN=jsmith/CN=812345/CN=John Smith";

/// In-memory backend that echoes `"{id}:{token}:{body}"` after `delay`,
/// or fails with `failure`.
pub struct MockBackend {
    calls: Mutex<Vec<ForwardRequest>>,
    delay: Duration,
    deadline: Duration,
    failure: Option<fn() -> RpcError>,
    content_type: String,
}

impl MockBackend {
    pub fn echo() -> Arc<Self> {
        Self::slow(Duration::ZERO)
    }

    /// Responds after `delay`, bounded by the default 10s deadline.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay,
            deadline: Duration::from_secs(10),
            failure: None,
            content_type: "application/json".into(),
        })
    }

    /// Echoes, labelling every payload with `content_type`.
    pub fn with_content_type(content_type: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            deadline: Duration::from_secs(10),
            failure: None,
            content_type: content_type.into(),
        })
    }

    pub fn failing(failure: fn() -> RpcError) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            deadline: Duration::from_secs(10),
            failure: Some(failure),
            content_type: String::new(),
        })
    }

    pub fn calls(&self) -> Vec<ForwardRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    async fn call(&self, request: ForwardRequest) -> Result<ForwardResponse, RpcError> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(failure) = self.failure {
            return Err(failure());
        }

        let delay = self.delay;
        let content_type = self.content_type.clone();
        call_with_deadline(self.deadline, async move {
            tokio::time::sleep(delay).await;
            let mut payload = format!("{}:{}:", request.identifier, request.token).into_bytes();
            payload.extend_from_slice(&request.body);
            Ok(ForwardResponse {
                payload: Bytes::from(payload),
                content_type,
            })
        })
        .await
    }
}

pub fn test_config() -> Config {
    serde_yaml::from_str(
        "server:\n  base: /api\n  max_body_bytes: 64\n  identity_header: X-Ssl-Client-S-Dn\nbackend:\n  address: http://127.0.0.1:9999\n",
    )
    .unwrap()
}

/// Store in `dn` mode holding John Smith (id 1) and Alice Doe (id 2).
pub fn loaded_store() -> CacheStore {
    let store = CacheStore::new(KeyMode::Dn);
    store.rebuild(
        snapshot_by_id(vec![
            record(1, "jsmith", &[JOHN_DN]),
            record(2, "adoe", &["/DC=ch/DC=cern/CN=54321/CN=Alice Doe"]),
        ]),
        Some("registry.json".into()),
    );
    store
}

pub fn test_state(store: CacheStore, backend: Arc<dyn Backend>) -> Arc<AppState> {
    Arc::new(AppState {
        config: Arc::new(test_config()),
        store,
        backend,
        identity: Arc::new(HeaderIdentity::new(DN_HEADER).unwrap()),
        metrics: MetricsRegistry::new(),
    })
}
