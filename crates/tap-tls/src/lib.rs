use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;

mod certificate_store;

pub use certificate_store::MitmCertificateStore;

pub const HTTP1_ALPN: &[u8] = b"http/1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailureReason {
    UnknownCa,
    CertValidation,
    HandshakeAlert,
    Timeout,
    EofOrReset,
    Other,
}

impl TlsFailureReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownCa => "unknown_ca",
            Self::CertValidation => "cert_validation",
            Self::HandshakeAlert => "handshake",
            Self::Timeout => "timeout",
            Self::EofOrReset => "eof_or_reset",
            Self::Other => "other",
        }
    }
}

/// Buckets a TLS error message into a stable reason code for logs and metrics.
pub fn classify_tls_error(error_text: &str) -> TlsFailureReason {
    let lower = error_text.to_ascii_lowercase();

    if contains_any(
        &lower,
        &[
            "unknown ca",
            "unknown_ca",
            "unknown issuer",
            "unknownissuer",
            "unknownca",
            "self signed",
            "self-signed",
            "unable to get local issuer certificate",
        ],
    ) {
        return TlsFailureReason::UnknownCa;
    }
    if contains_any(
        &lower,
        &["timed out", "timeout", "deadline has elapsed"],
    ) {
        return TlsFailureReason::Timeout;
    }
    if contains_any(
        &lower,
        &[
            "eof",
            "connection reset",
            "broken pipe",
            "connection aborted",
        ],
    ) {
        return TlsFailureReason::EofOrReset;
    }
    if contains_any(
        &lower,
        &[
            "invalid peer certificate",
            "certificate",
            "x509",
            "name mismatch",
            "expired",
            "not valid",
        ],
    ) {
        return TlsFailureReason::CertValidation;
    }
    if contains_any(
        &lower,
        &["handshake", "alert", "protocol version", "decrypt error"],
    ) {
        return TlsFailureReason::HandshakeAlert;
    }

    TlsFailureReason::Other
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate store lock poisoned")]
    LockPoisoned,
    #[error("invalid TLS configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateAuthorityConfig {
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub leaf_cert_cache_capacity: usize,
}

impl Default for CertificateAuthorityConfig {
    fn default() -> Self {
        Self {
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            ca_common_name: "sse-tap Local CA".to_string(),
            ca_organization: "sse-tap".to_string(),
            leaf_cert_cache_capacity: 1024,
        }
    }
}

impl CertificateAuthorityConfig {
    fn validate(&self) -> Result<(), TlsConfigError> {
        match (
            self.ca_cert_pem_path.as_ref(),
            self.ca_key_pem_path.as_ref(),
        ) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(TlsConfigError::InvalidConfiguration(
                    "ca_cert_pem_path and ca_key_pem_path must either both be set or both be unset"
                        .to_string(),
                ));
            }
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(TlsConfigError::InvalidConfiguration(
                "ca_common_name must not be empty".to_string(),
            ));
        }
        if self.ca_organization.trim().is_empty() {
            return Err(TlsConfigError::InvalidConfiguration(
                "ca_organization must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

impl LeafCacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

/// A leaf certificate minted for one host, ready to terminate client TLS.
#[derive(Debug, Clone)]
pub struct LeafCertificate {
    pub host: String,
    /// Leaf first, then the issuing CA.
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
}

impl LeafCertificate {
    pub fn leaf_cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }
}

/// Source of per-host certificates used when intercepting a TLS tunnel.
pub trait CertificateProvider: Send + Sync {
    fn get_leaf_cert(&self, hostname: &str) -> Result<LeafCertificate, TlsConfigError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CertStoreMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

/// Server config for `host` signed by a throwaway CA. Handy for local
/// upstream fixtures.
pub fn build_http1_server_config_for_host(host: &str) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let cert_store = MitmCertificateStore::new(CertificateAuthorityConfig::default())?;
    Ok(cert_store.get_leaf_cert(host)?.server_config)
}

pub fn build_http1_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];
    Arc::new(config)
}

/// Client config trusting exactly the given roots, used when the upstream is
/// signed by a private CA.
pub fn build_http1_client_config_with_roots(
    roots: &[CertificateDer<'static>],
) -> Result<Arc<ClientConfig>, TlsConfigError> {
    let mut root_store = RootCertStore::empty();
    for root in roots {
        root_store.add(root.clone())?;
    }
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
