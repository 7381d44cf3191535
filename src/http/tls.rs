//! rustls server configuration for the HTTPS listener.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::ServerTlsConfig;

/// Build the acceptor for `config`.
///
/// With a `client_ca` configured, client certificates are requested and
/// verified against it.  Connections without one are still accepted so the
/// gateway can answer them with 401 instead of a handshake failure.
pub fn build_acceptor(config: &ServerTlsConfig) -> Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let certs = load_certs(&config.server_cert)?;
    let key = PrivateKeyDer::from_pem_file(&config.server_key)
        .with_context(|| format!("failed to read server key {}", config.server_key.display()))?;

    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("no usable TLS protocol versions")?;

    let builder = match &config.client_ca {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .with_context(|| format!("invalid CA certificate in {}", ca.display()))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()
                .context("failed to build client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut server_config = builder
        .with_single_cert(certs, key)
        .context("unusable server certificate or key")?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(
        cert = %config.server_cert.display(),
        client_auth = config.client_ca.is_some(),
        "TLS configured"
    );
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in {}", path.display());
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn testdata(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    fn tls_config(client_ca: Option<&str>) -> ServerTlsConfig {
        ServerTlsConfig {
            server_cert: testdata("server.pem"),
            server_key: testdata("server.key"),
            client_ca: client_ca.map(testdata),
        }
    }

    #[test]
    fn test_acceptor_without_client_auth() {
        assert!(build_acceptor(&tls_config(None)).is_ok());
    }

    #[test]
    fn test_acceptor_with_client_ca() {
        assert!(build_acceptor(&tls_config(Some("ca.pem"))).is_ok());
    }

    #[test]
    fn test_certificate_as_key_rejected() {
        let mut config = tls_config(None);
        config.server_key = testdata("server.pem");
        assert!(build_acceptor(&config).is_err());
    }

    #[test]
    fn test_missing_certificate_rejected() {
        let mut config = tls_config(None);
        config.server_cert = testdata("absent.pem");
        let Err(err) = build_acceptor(&config) else {
            panic!("acceptor built without a server certificate");
        };
        assert!(format!("{err:#}").contains("absent.pem"));
    }

    #[test]
    fn test_empty_ca_bundle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        let mut config = tls_config(None);
        config.client_ca = Some(empty);
        assert!(build_acceptor(&config).is_err());
    }
}
