//! Identity-authorizing HTTP gateway.
//!
//! Caller identities are resolved against a periodically refreshed registry
//! of distinguished names; authorised requests are forwarded to a gRPC
//! backend and the backend payload is relayed back verbatim.

pub mod config;
pub mod health;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod rpc;
pub mod server;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use crate::config::Config;
use crate::http::identity::IdentityExtractor;
use crate::metrics::MetricsRegistry;
use crate::registry::CacheStore;
use crate::rpc::Backend;

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Current registry generation; swapped by the refresher.
    pub store: CacheStore,
    pub backend: Arc<dyn Backend>,
    pub identity: Arc<dyn IdentityExtractor>,
    pub metrics: MetricsRegistry,
}
