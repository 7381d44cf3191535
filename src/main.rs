use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use identity_gateway::config::{self, LogConfig};
use identity_gateway::http::identity::build_extractor;
use identity_gateway::metrics::MetricsRegistry;
use identity_gateway::registry::{CacheStore, JsonRegistryParser, Refresher};
use identity_gateway::rpc::GrpcBackend;
use identity_gateway::{server, AppState};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "identity-gateway", about = "Registry-authorised gateway to a gRPC backend")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/identity-gateway/config.yaml")]
    config: PathBuf,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.default_directive()));

    let writer = match &log.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(log.file.is_none());
    let fmt_layer = if log.json {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    init_tracing(&config.log)?;
    tracing::info!(config_path = %cli.config.display(), "starting identity-gateway");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Registry ----
    let store = CacheStore::new(config.registry.key_mode);
    let parser = JsonRegistryParser::with_timeout(config.registry.fetch_timeout())
        .context("failed to build registry HTTP client")?;
    let refresher = Refresher::new(
        store.clone(),
        Arc::new(parser),
        &config.registry,
        metrics.clone(),
    );

    if config.registry.initial_load {
        match refresher.initial_load().await {
            Ok(Some(version)) => tracing::info!(version, "initial registry load complete"),
            Ok(None) => tracing::info!("no registry file configured, skipping initial load"),
            Err(e) => tracing::warn!(
                error = %e,
                "initial registry load failed, starting with an empty registry"
            ),
        }
    }

    // ---- Backend ----
    let backend = GrpcBackend::from_config(&config.backend)
        .context("failed to configure backend channel")?;

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        backend: Arc::new(backend),
        identity: build_extractor(&config.server)?,
        metrics,
    });

    // ---- Spawn services ----
    let cancel = CancellationToken::new();

    let refresher_handle = tokio::spawn(refresher.run(cancel.child_token()));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            server::shutdown_signal().await;
            cancel.cancel();
        }
    });

    let result = if config.server.http_server {
        server::run_http_server(state, cancel.clone()).await
    } else {
        server::run_proxy_server(state, cancel.clone()).await
    };

    // ---- Await shutdown ----
    cancel.cancel();
    if let Err(e) = refresher_handle.await {
        tracing::error!(error = %e, "registry refresher panicked");
    }

    match result {
        Ok(()) => {
            tracing::info!("identity-gateway shut down cleanly");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "gateway server failed");
            Err(e)
        }
    }
}
