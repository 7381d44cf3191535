//! Identity registry cache.
//!
//! The registry is an external directory of authorised identities.  It is
//! loaded wholesale by a [`RegistryParser`](parser::RegistryParser), turned
//! into an immutable [`RegistrySnapshot`] plus a derived [`SecondaryIndex`],
//! and published through the lock-free [`CacheStore`](store::CacheStore).
//! The [`Refresher`](refresher::Refresher) repeats this on a timer.

pub mod index;
pub mod parser;
pub mod refresher;
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use index::{build_index, dn_tokens};
pub use parser::{JsonRegistryParser, RegistryParser, RegistrySource};
pub use refresher::Refresher;
pub use store::CacheStore;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One identity as published by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Login", default)]
    pub login: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Primary subject DN, when the registry publishes one separately.
    #[serde(rename = "DN", default)]
    pub dn: String,
    #[serde(rename = "DNs", default)]
    pub dns: Vec<String>,
    /// Opaque role assignments (role name to scopes).
    #[serde(rename = "Roles", default)]
    pub roles: BTreeMap<String, Vec<String>>,
}

impl IdentityRecord {
    /// All subject DNs of this record, primary `DN` first, without duplicates.
    pub fn subject_dns(&self) -> impl Iterator<Item = &str> {
        let primary = (!self.dn.is_empty()).then_some(self.dn.as_str());
        primary.into_iter().chain(
            self.dns
                .iter()
                .map(String::as_str)
                .filter(move |dn| *dn != self.dn),
        )
    }
}

/// Complete registry contents keyed by primary key, ordered for
/// deterministic index construction.
pub type RegistrySnapshot = BTreeMap<String, Arc<IdentityRecord>>;

/// Lookup token to owning record.
pub type SecondaryIndex = HashMap<String, Arc<IdentityRecord>>;

// ---------------------------------------------------------------------------
// Key mode
// ---------------------------------------------------------------------------

/// How the registry is keyed, fixed at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// Primary key is the numeric record ID; lookups use the ID directly.
    Id,
    /// Primary key is the subject DN; lookups use CN-derived tokens.
    #[default]
    Dn,
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMode::Id => f.write_str("id"),
            KeyMode::Dn => f.write_str("dn"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of a single refresh attempt.  None of them are fatal; the
/// previously installed generation stays in place.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to fetch registry from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("registry endpoint {url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to read registry file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse registry document from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no registry source configured")]
    NoSource,
}


#[cfg(test)]
mod tests {
    use super::test_support::record;
    use super::*;

    #[test]
    fn test_key_mode_serde_values() {
        assert_eq!(serde_json::to_string(&KeyMode::Id).unwrap(), "\"id\"");
        assert_eq!(serde_json::to_string(&KeyMode::Dn).unwrap(), "\"dn\"");
        assert_eq!(KeyMode::default(), KeyMode::Dn);
    }

    #[test]
    fn test_subject_dns_deduplicates_primary() {
        let mut r = record(1, "jsmith", &["/CN=John Smith", "/CN=J. Smith"]);
        r.dn = "/CN=John Smith".into();
        let dns: Vec<&str> = r.subject_dns().collect();
        assert_eq!(dns, vec!["/CN=John Smith", "/CN=J. Smith"]);
    }

    #[test]
    fn test_subject_dns_without_primary() {
        let r = record(1, "jsmith", &["/CN=John Smith"]);
        assert_eq!(r.subject_dns().count(), 1);
    }

    #[test]
    fn test_record_deserialises_registry_field_names() {
        let json = r#"{"ID": 42, "Login": "jsmith", "Name": "John Smith",
                       "DNs": ["/DC=ch/CN=John Smith"], "Roles": {"admin": ["group:ops"]}}"#;
        let r: IdentityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.id, 42);
        assert_eq!(r.login, "jsmith");
        assert_eq!(r.dns, vec!["/DC=ch/CN=John Smith".to_string()]);
        assert_eq!(r.roles["admin"], vec!["group:ops".to_string()]);
        assert!(r.dn.is_empty());
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::NoSource;
        assert_eq!(err.to_string(), "no registry source configured");
    }
}
