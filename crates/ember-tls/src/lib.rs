//! TLS termination support for the ember server: builds a rustls
//! `ServerConfig` from certificate, key, and optional client-CA PEM files.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("invalid TLS configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to load certificate chain from {path}: {detail}")]
    CertificateLoad { path: String, detail: String },
    #[error("failed to load private key from {path}: {detail}")]
    PrivateKeyLoad { path: String, detail: String },
    #[error("failed to load CA certificates from {path}: {detail}")]
    CaLoad { path: String, detail: String },
    #[error("rustls rejected the server configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub certificate_file: String,
    pub private_key_file: String,
    pub ca_file: Option<String>,
    pub verify_client: bool,
    /// Accepted for configuration compatibility; rustls selects cipher
    /// suites through its provider and does not take an OpenSSL-style list.
    pub cipher_list: Option<String>,
}

impl TlsSettings {
    pub fn validate(&self) -> Result<(), TlsConfigError> {
        if self.certificate_file.is_empty() {
            return Err(TlsConfigError::InvalidConfiguration(
                "ssl_certificate_file is required when HTTPS is enabled".to_string(),
            ));
        }
        if self.private_key_file.is_empty() {
            return Err(TlsConfigError::InvalidConfiguration(
                "ssl_private_key_file is required when HTTPS is enabled".to_string(),
            ));
        }
        if self.verify_client && self.ca_file.as_deref().map_or(true, str::is_empty) {
            return Err(TlsConfigError::InvalidConfiguration(
                "ssl_verify_client requires ssl_ca_file".to_string(),
            ));
        }
        Ok(())
    }

    pub fn build_server_config(&self) -> Result<Arc<ServerConfig>, TlsConfigError> {
        self.validate()?;

        let chain = load_certificate_chain(&self.certificate_file)?;
        let private_key = load_private_key(&self.private_key_file)?;

        let builder = match (&self.ca_file, self.verify_client) {
            (Some(ca_file), true) => {
                let roots = load_root_store(ca_file)?;
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|error| {
                        TlsConfigError::InvalidConfiguration(format!(
                            "client certificate verifier rejected the CA set: {error}"
                        ))
                    })?;
                ServerConfig::builder().with_client_cert_verifier(verifier)
            }
            _ => ServerConfig::builder().with_no_client_auth(),
        };

        let mut config = builder.with_single_cert(chain, private_key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

fn load_certificate_chain(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let iter = CertificateDer::pem_file_iter(Path::new(path)).map_err(|error| {
        TlsConfigError::CertificateLoad {
            path: path.to_string(),
            detail: error.to_string(),
        }
    })?;
    let chain = iter
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| TlsConfigError::CertificateLoad {
            path: path.to_string(),
            detail: error.to_string(),
        })?;
    if chain.is_empty() {
        return Err(TlsConfigError::CertificateLoad {
            path: path.to_string(),
            detail: "no certificates found in PEM file".to_string(),
        });
    }
    Ok(chain)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    PrivateKeyDer::from_pem_file(Path::new(path)).map_err(|error| {
        TlsConfigError::PrivateKeyLoad {
            path: path.to_string(),
            detail: error.to_string(),
        }
    })
}

fn load_root_store(path: &str) -> Result<RootCertStore, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    let iter = CertificateDer::pem_file_iter(Path::new(path)).map_err(|error| {
        TlsConfigError::CaLoad {
            path: path.to_string(),
            detail: error.to_string(),
        }
    })?;
    for certificate in iter {
        let certificate = certificate.map_err(|error| TlsConfigError::CaLoad {
            path: path.to_string(),
            detail: error.to_string(),
        })?;
        roots.add(certificate).map_err(|error| TlsConfigError::CaLoad {
            path: path.to_string(),
            detail: error.to_string(),
        })?;
    }
    if roots.is_empty() {
        return Err(TlsConfigError::CaLoad {
            path: path.to_string(),
            detail: "no CA certificates found in PEM file".to_string(),
        });
    }
    Ok(roots)
}

/// Coarse failure buckets for handshake diagnostics logging.
pub fn classify_tls_error(error_text: &str) -> &'static str {
    let lower = error_text.to_ascii_lowercase();
    if lower.contains("unknown ca")
        || lower.contains("unknownissuer")
        || lower.contains("unknown issuer")
        || lower.contains("bad certificate")
        || lower.contains("certificate")
    {
        "cert_validation"
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "timeout"
    } else if lower.contains("alert") || lower.contains("handshake") {
        "handshake"
    } else if lower.contains("reset") || lower.contains("eof") || lower.contains("broken pipe") {
        "eof_or_reset"
    } else {
        "other"
    }
}
