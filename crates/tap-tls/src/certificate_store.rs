use std::fs;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::{
    CertStoreMetricsSnapshot, CertificateAuthorityConfig, CertificateProvider, LeafCacheStatus,
    LeafCertificate, TlsConfigError, HTTP1_ALPN,
};

/// Local CA plus an LRU of leaf certificates keyed by normalised host.
pub struct MitmCertificateStore {
    ca: CaMaterial,
    leaf_cache: Option<Mutex<LruCache<String, CachedLeaf>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

#[derive(Clone)]
struct CachedLeaf {
    cert_chain: Vec<CertificateDer<'static>>,
    server_config: Arc<ServerConfig>,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

impl MitmCertificateStore {
    pub fn new(config: CertificateAuthorityConfig) -> Result<Self, TlsConfigError> {
        config.validate()?;
        let ca = load_or_generate_ca_material(&config)?;
        let leaf_cache = NonZeroUsize::new(config.leaf_cert_cache_capacity)
            .map(|capacity| Mutex::new(LruCache::new(capacity)));
        Ok(Self {
            ca,
            leaf_cache,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        })
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    pub fn ca_certificate_der(&self) -> &CertificateDer<'static> {
        &self.ca.cert_der
    }

    pub fn cached_leaf_count(&self) -> usize {
        self.leaf_cache
            .as_ref()
            .and_then(|cache| cache.lock().ok().map(|cache| cache.len()))
            .unwrap_or(0)
    }

    pub fn metrics_snapshot(&self) -> CertStoreMetricsSnapshot {
        CertStoreMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }
}

impl CertificateProvider for MitmCertificateStore {
    fn get_leaf_cert(&self, hostname: &str) -> Result<LeafCertificate, TlsConfigError> {
        let host = normalize_host(hostname);

        if let Some(cache) = &self.leaf_cache {
            let mut cache = cache.lock().map_err(|_| TlsConfigError::LockPoisoned)?;
            if let Some(cached) = cache.get(&host) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(LeafCertificate {
                    host,
                    cert_chain: cached.cert_chain.clone(),
                    server_config: Arc::clone(&cached.server_config),
                    cache_status: LeafCacheStatus::Hit,
                });
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let issued = issue_leaf(&self.ca, &host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(host = %host, "issued leaf certificate");

        if let Some(cache) = &self.leaf_cache {
            let mut cache = cache.lock().map_err(|_| TlsConfigError::LockPoisoned)?;
            cache.put(host.clone(), issued.clone());
        }

        Ok(LeafCertificate {
            host,
            cert_chain: issued.cert_chain,
            server_config: issued.server_config,
            cache_status: LeafCacheStatus::Miss,
        })
    }
}

fn load_or_generate_ca_material(
    config: &CertificateAuthorityConfig,
) -> Result<CaMaterial, TlsConfigError> {
    match (&config.ca_cert_pem_path, &config.ca_key_pem_path) {
        (Some(ca_cert_path), Some(ca_key_path)) => {
            let cert_exists = Path::new(ca_cert_path).exists();
            let key_exists = Path::new(ca_key_path).exists();

            match (cert_exists, key_exists) {
                (true, true) => load_ca_material(ca_cert_path, ca_key_path),
                (false, false) => {
                    let generated = generate_ca_material(config)?;
                    persist_ca_material(ca_cert_path, ca_key_path, &generated)?;
                    tracing::info!(cert = %ca_cert_path, "generated new interception CA");
                    Ok(generated)
                }
                _ => Err(TlsConfigError::InvalidConfiguration(
                    "CA cert and key files must both exist or both be absent".to_string(),
                )),
            }
        }
        (None, None) => generate_ca_material(config),
        _ => Err(TlsConfigError::InvalidConfiguration(
            "ca_cert_pem_path and ca_key_pem_path must be set together".to_string(),
        )),
    }
}

fn generate_ca_material(config: &CertificateAuthorityConfig) -> Result<CaMaterial, TlsConfigError> {
    let ca_key = KeyPair::generate()?;
    let key_pem = ca_key.serialize_pem();
    let ca_params = build_ca_params(config);
    let ca_cert = ca_params.self_signed(&ca_key)?;
    let cert_pem = ca_cert.pem();
    let cert_der = ca_cert.der().clone();
    let issuer = Issuer::new(ca_params, ca_key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn load_ca_material(ca_cert_path: &str, ca_key_path: &str) -> Result<CaMaterial, TlsConfigError> {
    let cert_pem = fs::read_to_string(ca_cert_path)?;
    let key_pem = fs::read_to_string(ca_key_path)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsConfigError::InvalidConfiguration(format!(
            "failed to parse CA certificate PEM from {ca_cert_path}: {error}"
        ))
    })?;
    let ca_key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
        TlsConfigError::InvalidConfiguration(format!(
            "failed to parse issuer metadata from CA certificate {ca_cert_path}: {error}"
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn persist_ca_material(
    ca_cert_path: &str,
    ca_key_path: &str,
    ca: &CaMaterial,
) -> Result<(), TlsConfigError> {
    ensure_parent_exists(ca_cert_path)?;
    ensure_parent_exists(ca_key_path)?;
    fs::write(ca_cert_path, ca.cert_pem.as_bytes())?;
    fs::write(ca_key_path, ca.key_pem.as_bytes())?;
    Ok(())
}

fn ensure_parent_exists(path: &str) -> Result<(), TlsConfigError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn issue_leaf(ca: &CaMaterial, host: &str) -> Result<CachedLeaf, TlsConfigError> {
    let leaf_params = build_leaf_params(host)?;
    let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca.issuer)?;

    let cert_chain = vec![leaf_cert.der().clone(), ca.cert_der.clone()];
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain.clone(), PrivateKeyDer::from(leaf_key_der))?;
    server_config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];

    Ok(CachedLeaf {
        cert_chain,
        server_config: Arc::new(server_config),
    })
}

fn build_ca_params(config: &CertificateAuthorityConfig) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.ca_common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.ca_organization.clone());
    params.distinguished_name = distinguished_name;
    params
}

fn build_leaf_params(host: &str) -> Result<CertificateParams, TlsConfigError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}

/// Lower-cases DNS names and strips IPv6 brackets so equivalent hosts share
/// one cache slot.
fn normalize_host(host: &str) -> String {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => trimmed.trim_end_matches('.').to_ascii_lowercase(),
    }
}
