//! Caller identity extraction.
//!
//! Turns an inbound request into the list of registry tokens it may be
//! authorised under.  The subject DN comes either from the client
//! certificate presented on the TLS connection (inserted into the request
//! extensions by the accept loop) or, when the gateway does not verify
//! certificates itself, from a header set by a trusted TLS terminator in
//! front of it.

use std::sync::Arc;

use anyhow::Context;
use axum::http::request::Parts;
use axum::http::HeaderName;
use bytes::Bytes;
use tracing::{debug, warn};
use x509_parser::objects::{oid2abbrev, oid_registry};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::ServerConfig;
use crate::registry::dn_tokens;

/// DER-encoded leaf certificate presented by the TLS peer.
#[derive(Debug, Clone)]
pub struct PeerCertificate(pub Bytes);

/// Who the caller claims to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Presented subject (DN or raw token), for logging.
    pub subject: String,
    /// Lookup tokens in preference order.
    pub candidates: Vec<String>,
}

impl CallerIdentity {
    /// Identity from a DN, most specific Common-Name first.
    pub fn from_dn(dn: &str) -> Option<Self> {
        let mut candidates: Vec<String> = dn_tokens(dn).map(str::to_string).collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.reverse();
        Some(Self {
            subject: dn.to_string(),
            candidates,
        })
    }

    /// Identity from a header value: tokenised when it looks like a DN, used
    /// verbatim otherwise.
    pub fn from_header_value(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            None
        } else if value.contains("/CN=") {
            Self::from_dn(value)
        } else {
            Some(Self {
                subject: value.to_string(),
                candidates: vec![value.to_string()],
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

pub trait IdentityExtractor: Send + Sync {
    fn extract(&self, parts: &Parts) -> Option<CallerIdentity>;
}

/// Reads the [`PeerCertificate`] extension.
#[derive(Debug, Default, Clone)]
pub struct CertificateIdentity;

impl IdentityExtractor for CertificateIdentity {
    fn extract(&self, parts: &Parts) -> Option<CallerIdentity> {
        let cert = parts.extensions.get::<PeerCertificate>()?;
        match subject_dn(&cert.0) {
            Ok(dn) => CallerIdentity::from_dn(&dn),
            Err(e) => {
                warn!(error = %e, "unable to parse client certificate subject");
                None
            }
        }
    }
}

/// Reads the subject from a request header.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    pub fn new(header: &str) -> Result<Self, axum::http::header::InvalidHeaderName> {
        Ok(Self {
            header: HeaderName::try_from(header)?,
        })
    }
}

impl IdentityExtractor for HeaderIdentity {
    fn extract(&self, parts: &Parts) -> Option<CallerIdentity> {
        let value = parts.headers.get(&self.header)?;
        match value.to_str() {
            Ok(value) => CallerIdentity::from_header_value(value),
            Err(_) => {
                debug!(header = %self.header, "ignoring non-ASCII identity header");
                None
            }
        }
    }
}

/// Pick the extractor for the listener mode.
///
/// A listener that verifies client certificates identifies callers by their
/// certificate only; a header on such a socket comes from the caller itself
/// and is never trusted.  Otherwise `identity_header` must be configured and
/// is expected to be set by a TLS terminator in front of the gateway.
pub fn build_extractor(config: &ServerConfig) -> anyhow::Result<Arc<dyn IdentityExtractor>> {
    if config.verifies_client_certs() {
        if let Some(name) = &config.identity_header {
            warn!(header = %name, "client certificates are verified, ignoring identity header");
        }
        return Ok(Arc::new(CertificateIdentity));
    }

    let name = config.identity_header.as_deref().ok_or_else(|| {
        anyhow::anyhow!("no client CA and no identity header configured, callers cannot be identified")
    })?;
    let extractor = HeaderIdentity::new(name)
        .with_context(|| format!("invalid identity header {name:?}"))?;
    Ok(Arc::new(extractor))
}

// ---------------------------------------------------------------------------
// Certificate subject
// ---------------------------------------------------------------------------

/// Render the certificate subject in slash form, e.g.
/// `/DC=ch/DC=cern/OU=Organic Units/CN=John Smith`.
pub fn subject_dn(der: &[u8]) -> Result<String, String> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| e.to_string())?;
    let registry = oid_registry();

    let mut dn = String::new();
    for rdn in cert.subject().iter() {
        for attr in rdn.iter() {
            let key = oid2abbrev(attr.attr_type(), registry)
                .map(str::to_string)
                .unwrap_or_else(|_| attr.attr_type().to_id_string());
            let value = attr.as_str().map_err(|e| format!("{key}: {e}"))?;
            dn.push('/');
            dn.push_str(&key);
            dn.push('=');
            dn.push_str(value);
        }
    }
    Ok(dn)
}
