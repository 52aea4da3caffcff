use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use ember_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    RateLimit(#[from] ember_limit::RateLimitConfigError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub thread_pool_size: usize,
    pub document_root: String,
    pub max_connections: usize,
    pub keep_alive_timeout: u64,
    pub max_request_size: usize,
    pub enable_logging: bool,
    /// Accepted for configuration compatibility; log output routing is
    /// handled by the `tracing` subscriber installed at process start.
    pub log_file: String,

    pub enable_https: bool,
    pub https_port: u16,
    pub ssl_certificate_file: String,
    pub ssl_private_key_file: String,
    pub ssl_ca_file: String,
    /// Accepted for compatibility with OpenSSL-based deployments; rustls
    /// negotiates DH parameters internally and ignores this file.
    pub ssl_dh_file: String,
    pub ssl_verify_client: bool,
    pub ssl_cipher_list: String,

    pub serve_static_files: bool,
    pub index_files: Vec<String>,
    pub mime_types: BTreeMap<String, String>,

    pub enable_compression: bool,
    pub compression_min_size: usize,
    pub compression_level: u32,
    pub compressible_types: Vec<String>,

    pub websocket_max_frame_size: usize,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            thread_pool_size: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            document_root: "./public".to_string(),
            max_connections: 1000,
            keep_alive_timeout: 30,
            max_request_size: 1024 * 1024,
            enable_logging: true,
            log_file: String::new(),
            enable_https: false,
            https_port: 8443,
            ssl_certificate_file: String::new(),
            ssl_private_key_file: String::new(),
            ssl_ca_file: String::new(),
            ssl_dh_file: String::new(),
            ssl_verify_client: false,
            ssl_cipher_list: "HIGH:!aNULL:!MD5".to_string(),
            serve_static_files: true,
            index_files: vec!["index.html".to_string(), "index.htm".to_string()],
            mime_types: BTreeMap::new(),
            enable_compression: true,
            compression_min_size: 1024,
            compression_level: 6,
            compressible_types: vec![
                "text/plain".to_string(),
                "text/html".to_string(),
                "text/css".to_string(),
                "application/javascript".to_string(),
                "application/json".to_string(),
                "application/xml".to_string(),
                "text/xml".to_string(),
            ],
            websocket_max_frame_size: 1024 * 1024,
            rate_limit: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn keep_alive_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::Invalid(
                "max_request_size must be greater than zero".to_string(),
            ));
        }
        if self.enable_https {
            if self.ssl_certificate_file.is_empty() || self.ssl_private_key_file.is_empty() {
                return Err(ConfigError::Invalid(
                    "enable_https requires ssl_certificate_file and ssl_private_key_file"
                        .to_string(),
                ));
            }
            // Port 0 asks the OS for an ephemeral port, so a clash is only
            // meaningful for fixed assignments.
            if self.https_port == self.port && self.port != 0 {
                return Err(ConfigError::Invalid(
                    "https_port must differ from port".to_string(),
                ));
            }
        }
        if self.ssl_verify_client && self.ssl_ca_file.is_empty() {
            return Err(ConfigError::Invalid(
                "ssl_verify_client requires ssl_ca_file".to_string(),
            ));
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }

    pub fn tls_settings(&self) -> ember_tls::TlsSettings {
        ember_tls::TlsSettings {
            certificate_file: self.ssl_certificate_file.clone(),
            private_key_file: self.ssl_private_key_file.clone(),
            ca_file: if self.ssl_ca_file.is_empty() {
                None
            } else {
                Some(self.ssl_ca_file.clone())
            },
            verify_client: self.ssl_verify_client,
            cipher_list: if self.ssl_cipher_list.is_empty() {
                None
            } else {
                Some(self.ssl_cipher_list.clone())
            },
        }
    }

    pub fn mime_type_for(&self, extension: &str) -> String {
        if let Some(overridden) = self.mime_types.get(&extension.to_ascii_lowercase()) {
            return overridden.clone();
        }
        ember_http::mime_type_for_extension(extension).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, ServerConfig};

    #[test]
    fn defaults_match_the_documented_limits() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_request_size, 1024 * 1024);
        assert_eq!(config.keep_alive_timeout, 30);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.websocket_max_frame_size, 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let mut config = ServerConfig::default();
        config.port = 9090;
        config.document_root = "/srv/www".to_string();
        config
            .mime_types
            .insert("wasm".to_string(), "application/wasm".to_string());

        let json = config.to_json();
        let reloaded = ServerConfig::from_json_str(&json).expect("must reload");
        assert_eq!(reloaded, config);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config =
            ServerConfig::from_json_str(r#"{"port": 3000, "serve_static_files": false}"#)
                .expect("must parse");
        assert_eq!(config.port, 3000);
        assert!(!config.serve_static_files);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = ServerConfig::from_json_str(r#"{"prot": 3000}"#).expect_err("must fail");
        assert!(matches!(error, ConfigError::Json(_)));
    }

    #[test]
    fn https_requires_certificate_material() {
        let error = ServerConfig::from_json_str(r#"{"enable_https": true}"#)
            .expect_err("must fail");
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn verify_client_without_ca_is_an_illegal_configuration() {
        let error = ServerConfig::from_json_str(r#"{"ssl_verify_client": true}"#)
            .expect_err("must fail");
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn rate_limit_block_is_validated() {
        let error = ServerConfig::from_json_str(
            r#"{"rate_limit": {"strategy": "fixed_window", "max_requests": 0}}"#,
        )
        .expect_err("must fail");
        assert!(matches!(error, ConfigError::RateLimit(_)));
    }

    #[test]
    fn mime_overrides_win_over_the_builtin_table() {
        let mut config = ServerConfig::default();
        config
            .mime_types
            .insert("js".to_string(), "text/javascript".to_string());
        assert_eq!(config.mime_type_for("js"), "text/javascript");
        assert_eq!(config.mime_type_for("css"), "text/css");
    }
}
