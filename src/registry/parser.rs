//! Registry document loading.
//!
//! The registry publishes a JSON document that is either a list of records
//! or an object mapping display names to records.  [`JsonRegistryParser`]
//! reads it from a local file or over HTTP(S) and keys the records according
//! to the configured [`KeyMode`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{IdentityRecord, KeyMode, RegistryError, RegistrySnapshot};

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    File(PathBuf),
    Url(String),
}

impl fmt::Display for RegistrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrySource::File(path) => write!(f, "{}", path.display()),
            RegistrySource::Url(url) => f.write_str(url),
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Produces a complete snapshot from a registry source.
#[async_trait::async_trait]
pub trait RegistryParser: Send + Sync {
    async fn load(
        &self,
        source: &RegistrySource,
        mode: KeyMode,
    ) -> Result<RegistrySnapshot, RegistryError>;
}

// ---------------------------------------------------------------------------
// JSON implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryDocument {
    List(Vec<IdentityRecord>),
    Map(BTreeMap<String, IdentityRecord>),
}

impl RegistryDocument {
    fn into_records(self) -> Vec<IdentityRecord> {
        match self {
            RegistryDocument::List(records) => records,
            RegistryDocument::Map(records) => records.into_values().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonRegistryParser {
    http_client: reqwest::Client,
}

impl JsonRegistryParser {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    /// Build a parser with its own HTTP client bounded by `fetch_timeout`.
    pub fn with_timeout(fetch_timeout: Duration) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("identity-gateway/", env!("CARGO_PKG_VERSION")))
            .timeout(fetch_timeout)
            .build()?;
        Ok(Self::new(http_client))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, RegistryError> {
        let fetch_err = |source| RegistryError::Fetch {
            url: url.to_string(),
            source,
        };
        let resp = self
            .http_client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(fetch_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                url: url.to_string(),
                status,
            });
        }
        let body = resp.bytes().await.map_err(fetch_err)?;
        Ok(body.to_vec())
    }
}

#[async_trait::async_trait]
impl RegistryParser for JsonRegistryParser {
    async fn load(
        &self,
        source: &RegistrySource,
        mode: KeyMode,
    ) -> Result<RegistrySnapshot, RegistryError> {
        let bytes = match source {
            RegistrySource::File(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| RegistryError::Io {
                        path: path.display().to_string(),
                        source,
                    })?
            }
            RegistrySource::Url(url) => self.fetch(url).await?,
        };
        parse_document(&bytes, mode, &source.to_string())
    }
}

/// Parse a registry document and key its records by `mode`.
pub fn parse_document(
    bytes: &[u8],
    mode: KeyMode,
    origin: &str,
) -> Result<RegistrySnapshot, RegistryError> {
    let document: RegistryDocument =
        serde_json::from_slice(bytes).map_err(|source| RegistryError::Parse {
            origin: origin.to_string(),
            source,
        })?;
    let records = document.into_records();
    let total = records.len();

    let mut snapshot = RegistrySnapshot::new();
    let mut unkeyed = 0usize;
    for record in records {
        let record = Arc::new(record);
        match mode {
            KeyMode::Id => {
                snapshot.insert(record.id.to_string(), record);
            }
            KeyMode::Dn => {
                let mut keyed = false;
                for dn in record.subject_dns() {
                    snapshot.insert(dn.to_string(), Arc::clone(&record));
                    keyed = true;
                }
                if !keyed {
                    unkeyed += 1;
                }
            }
        }
    }

    debug!(
        origin,
        %mode,
        records = total,
        keys = snapshot.len(),
        unkeyed,
        "parsed registry document"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_DOC: &str = r#"[
        {"ID": 1, "Login": "jsmith", "Name": "John Smith",
         "DNs": ["/DC=ch/DC=cern/OU=Organic Units/CN=12345/CN=John Smith",
                 "/DC=org/CN=jsmith"]},
        {"ID": 2, "Login": "adoe", "Name": "Alice Doe",
         "DN": "/DC=ch/CN=Alice Doe", "DNs": ["/DC=ch/CN=Alice Doe"]},
        {"ID": 3, "Login": "robot", "Name": "No DN"}
    ]"#;

    const MAP_DOC: &str = r#"{
        "John Smith": {"ID": 1, "Login": "jsmith", "DNs": ["/CN=John Smith"]},
        "Alice Doe": {"ID": 2, "Login": "adoe", "DNs": ["/CN=Alice Doe"]}
    }"#;

    #[test]
    fn test_list_document_keyed_by_id() {
        let snapshot = parse_document(LIST_DOC.as_bytes(), KeyMode::Id, "test").unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot["1"].login, "jsmith");
        assert_eq!(snapshot["3"].login, "robot");
    }

    #[test]
    fn test_list_document_keyed_by_dn() {
        let snapshot = parse_document(LIST_DOC.as_bytes(), KeyMode::Dn, "test").unwrap();
        // Two DNs for jsmith, one (deduplicated) for adoe, none for robot.
        assert_eq!(snapshot.len(), 3);
        assert!(Arc::ptr_eq(
            &snapshot["/DC=org/CN=jsmith"],
            &snapshot["/DC=ch/DC=cern/OU=Organic Units/CN=12345/CN=John Smith"],
        ));
        assert_eq!(snapshot["/DC=ch/CN=Alice Doe"].id, 2);
    }

    #[test]
    fn test_map_document() {
        let snapshot = parse_document(MAP_DOC.as_bytes(), KeyMode::Id, "test").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["2"].login, "adoe");
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        let err = parse_document(b"{not json", KeyMode::Dn, "broken.json").unwrap_err();
        assert!(matches!(err, RegistryError::Parse { ref origin, .. } if origin == "broken.json"));
    }

    #[test]
    fn test_wrong_shape_is_parse_error() {
        let err = parse_document(br#"[{"Login": "no id"}]"#, KeyMode::Id, "x").unwrap_err();
        assert!(matches!(err, RegistryError::Parse { .. }));
    }

    #[test]
    fn test_source_display() {
        assert_eq!(
            RegistrySource::File(PathBuf::from("/etc/registry.json")).to_string(),
            "/etc/registry.json"
        );
        assert_eq!(
            RegistrySource::Url("https://registry.example/api".into()).to_string(),
            "https://registry.example/api"
        );
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, LIST_DOC).unwrap();

        let parser = JsonRegistryParser::new(reqwest::Client::new());
        let snapshot = parser
            .load(&RegistrySource::File(path), KeyMode::Id)
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 3);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let parser = JsonRegistryParser::new(reqwest::Client::new());
        let err = parser
            .load(
                &RegistrySource::File(PathBuf::from("/nonexistent/registry.json")),
                KeyMode::Dn,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Io { .. }));
    }
}
