use std::path::PathBuf;

const DEFAULT_PORT: u16 = 3600;

/// Layered configuration for the relay server: environment overrides a
/// built-in default (no CLI or config-file layer exists yet, but the struct
/// is already `serde::Deserialize` so a TOML file could feed it the same way
/// the corpus's own daemon config layers env/file/default).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RelayConfig {
    /// `LOG_LEVEL`: `debug|info|warn|error|silent`, default `info`.
    pub log_level: String,
    /// `PORT`, default 3600.
    pub port: u16,
    /// `TLS`, default `true`. When `true` but no certificate is configured,
    /// the server logs a warning and serves plaintext rather than refusing
    /// to start — see `tls_cert_path`/`tls_key_path`.
    pub tls: bool,
    /// Data directory for `.ciphermesh/` persistence, overridable via
    /// `CIPHERMESH_DATA_DIR`.
    pub data_dir: PathBuf,
    /// PEM certificate chain path, `CIPHERMESH_TLS_CERT`.
    pub tls_cert_path: Option<PathBuf>,
    /// PEM private key path, `CIPHERMESH_TLS_KEY`.
    pub tls_key_path: Option<PathBuf>,
}

impl RelayConfig {
    /// Build configuration from environment variables, falling back to
    /// built-in defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let tls = std::env::var("TLS")
            .ok()
            .map(|v| v != "false")
            .unwrap_or(true);

        let data_dir = std::env::var("CIPHERMESH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let tls_cert_path = std::env::var("CIPHERMESH_TLS_CERT").ok().map(PathBuf::from);
        let tls_key_path = std::env::var("CIPHERMESH_TLS_KEY").ok().map(PathBuf::from);

        Self {
            log_level,
            port,
            tls,
            data_dir,
            tls_cert_path,
            tls_key_path,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            port: DEFAULT_PORT,
            tls: true,
            data_dir: default_data_dir(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".ciphermesh")
}
