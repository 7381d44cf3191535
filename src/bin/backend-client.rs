//! One-shot client for the backend data service.
//!
//! Builds its channel with the same code path as the gateway, issues a
//! single call and writes the payload to stdout.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use identity_gateway::config::BackendConfig;
use identity_gateway::rpc::{Backend, ForwardRequest, GrpcBackend};

#[derive(Parser, Debug)]
#[command(name = "backend-client", about = "Call the backend data service once")]
struct Cli {
    /// Backend address, e.g. `http://127.0.0.1:9999`.
    #[arg(long)]
    address: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value_t = 0)]
    id: i64,
    /// Client certificate (PEM); selects TLS.
    #[arg(long)]
    cert: Option<PathBuf>,
    /// Private key for `--cert`; without it the channel is TLS without a
    /// client identity.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    /// CA bundle for the backend; native roots otherwise.
    #[arg(long)]
    ca: Option<PathBuf>,
    #[arg(long, default_value = "")]
    body: String,
    /// Call deadline in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

impl Cli {
    fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            address: self.address.clone(),
            timeout_secs: self.timeout,
            connect_timeout_secs: self.timeout,
            client_cert: self.cert.clone(),
            client_key: self.key.clone(),
            ca_cert: self.ca.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let backend = GrpcBackend::from_config(&cli.backend_config())
        .with_context(|| format!("invalid backend settings for {}", cli.address))?;

    let response = backend
        .call(ForwardRequest {
            identifier: cli.id,
            token: cli.token.clone(),
            body: Bytes::from(cli.body.clone()),
        })
        .await
        .with_context(|| format!("call to {} failed", backend.address()))?;

    tracing::info!(content_type = %response.content_type, "backend responded");
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&response.payload)?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults_map_to_backend_config() {
        let cli = Cli::parse_from(["backend-client", "--address", "backend:9999"]);
        let config = cli.backend_config();
        assert_eq!(config.timeout_secs, 10);
        assert!(config.client_cert.is_none());
        assert_eq!(cli.id, 0);
    }

    #[test]
    fn test_cert_alone_selects_tls() {
        let cli = Cli::try_parse_from([
            "backend-client",
            "--address",
            "backend:9999",
            "--cert",
            "client.pem",
        ])
        .unwrap();
        let config = cli.backend_config();
        assert_eq!(config.client_cert, Some(PathBuf::from("client.pem")));
        assert!(config.client_key.is_none());
    }

    #[test]
    fn test_key_requires_cert() {
        let result = Cli::try_parse_from([
            "backend-client",
            "--address",
            "backend:9999",
            "--key",
            "client.key",
        ]);
        assert!(result.is_err());
    }
}
