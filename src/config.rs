use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::registry::KeyMode;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Startup configuration failures.  All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{what} file {path} is not readable")]
    MissingFile { what: &'static str, path: PathBuf },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP port of the HTTP(S) listener.
    #[serde(default = "default_port")]
    pub port: u16,
    /// URL base path; every request under `{base}/` is forwarded.
    #[serde(default)]
    pub base: String,
    /// Serve the HTTP gateway.  `false` selects connection-level proxy mode,
    /// which is not implemented.
    #[serde(default = "bool_true")]
    pub http_server: bool,
    /// Upper bound on a forwarded request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Header carrying the caller DN when TLS is terminated upstream.  Only
    /// trusted when the gateway does not verify client certificates itself.
    #[serde(default)]
    pub identity_header: Option<String>,
    /// Presence of this section selects HTTPS mode.
    #[serde(default)]
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            base: String::new(),
            http_server: true,
            max_body_bytes: default_max_body_bytes(),
            identity_header: None,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// True when the listener itself requests and verifies client
    /// certificates.
    pub fn verifies_client_certs(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.client_ca.is_some())
    }

    /// Base path normalised to either `""` or `/segment[/segment...]`
    /// without a trailing slash.
    pub fn base_path(&self) -> String {
        let trimmed = self.base.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerTlsConfig {
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    /// CA bundle used to verify client certificates.  When absent no client
    /// certificate is requested.
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
}

fn default_port() -> u16 {
    8443
}

fn bool_true() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Append log lines to this file instead of stdout.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// 0 = info, 1 = debug, 2+ = trace.  `RUST_LOG` takes precedence.
    #[serde(default)]
    pub verbose: u8,
    #[serde(default = "bool_true")]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            verbose: 0,
            json: true,
        }
    }
}

impl LogConfig {
    pub fn default_directive(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

// ---------------------------------------------------------------------------
// Backend (gRPC)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// gRPC endpoint URI, e.g. `http://127.0.0.1:9999`.
    pub address: String,
    /// Deadline applied to every backend call, in seconds.
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Client certificate (PEM).  Presence selects a TLS channel.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    /// Trust roots for the backend.  Native roots are used when absent.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_backend_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Identity registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub source_file: Option<PathBuf>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub key_mode: KeyMode,
    /// Seconds between refresh attempts.  `0` means the default.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// 0 = silent, 1 = one sample record per cycle, 2+ = every record.
    #[serde(default)]
    pub verbose: u8,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// Load `source_file` synchronously before the server starts.
    #[serde(default = "bool_true")]
    pub initial_load: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            source_file: None,
            source_url: None,
            key_mode: KeyMode::default(),
            refresh_interval_secs: default_refresh_interval(),
            verbose: 0,
            fetch_timeout_secs: default_fetch_timeout(),
            initial_load: true,
        }
    }
}

impl RegistryConfig {
    pub fn refresh_interval(&self) -> Duration {
        match self.refresh_interval_secs {
            0 => Duration::from_secs(default_refresh_interval()),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn default_refresh_interval() -> u64 {
    3600
}

fn default_fetch_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML (or JSON) file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config, serde_yaml::Error> {
    serde_yaml::from_str(contents)
}

/// Checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if let Some(tls) = &config.server.tls {
        check_file("server certificate", &tls.server_cert)?;
        check_file("server key", &tls.server_key)?;
        if let Some(ca) = &tls.client_ca {
            check_file("client CA", ca)?;
        }
    }

    let backend = &config.backend;
    if backend.address.trim().is_empty() {
        return Err(ConfigError::Invalid("backend.address must not be empty".into()));
    }
    if backend.timeout_secs == 0 {
        return Err(ConfigError::Invalid("backend.timeout_secs must be > 0".into()));
    }
    if backend.connect_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "backend.connect_timeout_secs must be > 0".into(),
        ));
    }
    if backend.client_key.is_some() && backend.client_cert.is_none() {
        return Err(ConfigError::Invalid(
            "backend.client_key requires backend.client_cert".into(),
        ));
    }
    for (what, path) in [
        ("backend client certificate", &backend.client_cert),
        ("backend client key", &backend.client_key),
        ("backend CA", &backend.ca_cert),
    ] {
        if let Some(path) = path {
            check_file(what, path)?;
        }
    }

    if config.registry.fetch_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "registry.fetch_timeout_secs must be > 0".into(),
        ));
    }

    if config.server.max_body_bytes == 0 {
        return Err(ConfigError::Invalid("server.max_body_bytes must be > 0".into()));
    }
    if !config.server.verifies_client_certs() && config.server.identity_header.is_none() {
        return Err(ConfigError::Invalid(
            "callers cannot be identified: configure server.tls.client_ca or server.identity_header"
                .into(),
        ));
    }
    Ok(())
}

fn check_file(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::MissingFile {
            what,
            path: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = "backend:\n  address: http://127.0.0.1:9999\n";
    const PLAIN_WITH_HEADER: &str = "backend:\n  address: http://127.0.0.1:9999\nserver:\n  identity_header: X-Ssl-Client-S-Dn\n";

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config(MINIMAL).unwrap();

        assert_eq!(config.server.port, 8443);
        assert!(config.server.http_server);
        assert!(config.server.tls.is_none());
        assert_eq!(config.backend.timeout(), Duration::from_secs(10));
        assert_eq!(config.registry.key_mode, KeyMode::Dn);
        assert_eq!(config.registry.refresh_interval(), Duration::from_secs(3600));
        assert!(config.registry.initial_load);
        assert_eq!(config.log.default_directive(), "info");
        assert!(config.server.identity_header.is_none());
    }

    #[test]
    fn test_plain_http_requires_identity_header() {
        let config = parse_config(MINIMAL).unwrap();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(msg)) if msg.contains("identity_header")
        ));

        let config = parse_config(PLAIN_WITH_HEADER).unwrap();
        validate_config(&config).unwrap();
        assert!(!config.server.verifies_client_certs());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        for section in [
            "backend:\n  address: http://127.0.0.1:9999\n  connect_timeout_secs: 0\n",
            "backend:\n  address: http://127.0.0.1:9999\n  timeout_secs: 0\n",
        ] {
            let yaml = format!("{section}server:\n  identity_header: X-Dn\n");
            let config = parse_config(&yaml).unwrap();
            assert!(matches!(validate_config(&config), Err(ConfigError::Invalid(_))), "{yaml}");
        }

        let yaml = format!("{PLAIN_WITH_HEADER}registry:\n  fetch_timeout_secs: 0\n");
        let config = parse_config(&yaml).unwrap();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(msg)) if msg.contains("fetch_timeout_secs")
        ));
    }

    #[test]
    fn test_zero_refresh_interval_means_default() {
        let yaml = format!("{MINIMAL}registry:\n  refresh_interval_secs: 0\n");
        let config = parse_config(&yaml).unwrap();
        assert_eq!(config.registry.refresh_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_json_config_is_accepted() {
        let json = r#"{"server": {"port": 8080, "base": "/auth/"},
                       "backend": {"address": "http://backend:9999"},
                       "registry": {"key_mode": "id", "verbose": 1}}"#;
        let config = parse_config(json).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.base_path(), "/auth");
        assert_eq!(config.registry.key_mode, KeyMode::Id);
        assert_eq!(config.registry.verbose, 1);
    }

    #[test]
    fn test_base_path_normalisation() {
        let mut server = ServerConfig::default();
        assert_eq!(server.base_path(), "");
        server.base = "/".into();
        assert_eq!(server.base_path(), "");
        server.base = "api".into();
        assert_eq!(server.base_path(), "/api");
        server.base = "/api/v1/".into();
        assert_eq!(server.base_path(), "/api/v1");
    }

    #[test]
    fn test_missing_tls_files_are_fatal() {
        let yaml = format!(
            "{MINIMAL}server:\n  tls:\n    server_cert: /nonexistent/tls.crt\n    server_key: /nonexistent/tls.key\n"
        );
        let config = parse_config(&yaml).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingFile { what: "server certificate", .. }
        ));
    }

    #[test]
    fn test_tls_requires_key_as_well_as_cert() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("tls.crt");
        std::fs::File::create(&cert).unwrap().write_all(b"cert").unwrap();
        let yaml = format!(
            "{MINIMAL}server:\n  tls:\n    server_cert: {}\n    server_key: {}\n",
            cert.display(),
            dir.path().join("tls.key").display()
        );
        let config = parse_config(&yaml).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile { what: "server key", .. }));
    }

    #[test]
    fn test_client_key_without_cert_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("client.key");
        std::fs::write(&key, b"key").unwrap();
        let yaml = format!(
            "backend:\n  address: https://backend:9999\n  client_key: {}\n",
            key.display()
        );
        let config = parse_config(&yaml).unwrap();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config("/nonexistent/identity-gateway.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/identity-gateway.yaml"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PLAIN_WITH_HEADER.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.backend.address, "http://127.0.0.1:9999");
    }
}
