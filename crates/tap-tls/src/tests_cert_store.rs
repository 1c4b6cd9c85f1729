#[test]
fn classifies_unknown_ca_error_text() {
    assert_eq!(
        classify_tls_error("invalid peer certificate: UnknownIssuer"),
        TlsFailureReason::UnknownCa
    );
    assert_eq!(
        classify_tls_error("tls handshake eof"),
        TlsFailureReason::EofOrReset
    );
    assert_eq!(
        classify_tls_error("received fatal alert: HandshakeFailure"),
        TlsFailureReason::HandshakeAlert
    );
    assert_eq!(
        classify_tls_error("invalid peer certificate: Expired"),
        TlsFailureReason::CertValidation
    );
    assert_eq!(classify_tls_error("something else"), TlsFailureReason::Other);
}

#[test]
fn tls_failure_reason_codes_are_stable() {
    assert_eq!(TlsFailureReason::UnknownCa.code(), "unknown_ca");
    assert_eq!(TlsFailureReason::CertValidation.code(), "cert_validation");
    assert_eq!(TlsFailureReason::HandshakeAlert.code(), "handshake");
    assert_eq!(TlsFailureReason::Timeout.code(), "timeout");
    assert_eq!(TlsFailureReason::EofOrReset.code(), "eof_or_reset");
    assert_eq!(TlsFailureReason::Other.code(), "other");
}

#[test]
fn builds_server_and_client_configs_for_http1() {
    let server = build_http1_server_config_for_host("127.0.0.1").expect("server config");
    assert_eq!(server.alpn_protocols, vec![HTTP1_ALPN.to_vec()]);

    let secure = build_http1_client_config(false);
    let insecure = build_http1_client_config(true);
    assert_eq!(secure.alpn_protocols, vec![HTTP1_ALPN.to_vec()]);
    assert_eq!(insecure.alpn_protocols, vec![HTTP1_ALPN.to_vec()]);
}

#[test]
fn client_config_with_private_roots_accepts_store_ca() {
    let store =
        MitmCertificateStore::new(CertificateAuthorityConfig::default()).expect("cert store");
    let config = build_http1_client_config_with_roots(&[store.ca_certificate_der().clone()])
        .expect("client config");
    assert_eq!(config.alpn_protocols, vec![HTTP1_ALPN.to_vec()]);
}

#[test]
fn cert_store_cache_reports_hits_and_misses() {
    let store =
        MitmCertificateStore::new(CertificateAuthorityConfig::default()).expect("cert store");

    let first = store.get_leaf_cert("api.example.com").expect("first leaf");
    let second = store.get_leaf_cert("API.EXAMPLE.COM").expect("second leaf");

    assert_eq!(first.cache_status, LeafCacheStatus::Miss);
    assert_eq!(second.cache_status, LeafCacheStatus::Hit);
    assert_eq!(first.leaf_cert_der(), second.leaf_cert_der());
    assert_eq!(first.cert_chain.len(), 2);
    assert_eq!(&first.cert_chain[1], store.ca_certificate_der());
    assert_eq!(
        store.metrics_snapshot(),
        CertStoreMetricsSnapshot {
            cache_hits: 1,
            cache_misses: 1,
            leaves_issued: 1,
        }
    );
}

#[test]
fn cert_store_evicts_least_recently_used_leaf() {
    let config = CertificateAuthorityConfig {
        leaf_cert_cache_capacity: 2,
        ..CertificateAuthorityConfig::default()
    };
    let store = MitmCertificateStore::new(config).expect("cert store");

    store.get_leaf_cert("a.example.com").expect("a");
    store.get_leaf_cert("b.example.com").expect("b");
    // touch "a" so that "b" becomes the eviction candidate
    store.get_leaf_cert("a.example.com").expect("a again");
    store.get_leaf_cert("c.example.com").expect("c");

    assert_eq!(store.cached_leaf_count(), 2);
    assert_eq!(
        store.get_leaf_cert("a.example.com").expect("a").cache_status,
        LeafCacheStatus::Hit
    );
    assert_eq!(
        store.get_leaf_cert("b.example.com").expect("b").cache_status,
        LeafCacheStatus::Miss
    );
}

#[test]
fn cert_store_with_zero_capacity_never_hits_cache() {
    let config = CertificateAuthorityConfig {
        leaf_cert_cache_capacity: 0,
        ..CertificateAuthorityConfig::default()
    };
    let store = MitmCertificateStore::new(config).expect("cert store");
    for _ in 0..3 {
        let leaf = store.get_leaf_cert("api.example.com").expect("leaf");
        assert_eq!(leaf.cache_status, LeafCacheStatus::Miss);
    }
    assert_eq!(store.cached_leaf_count(), 0);
    assert_eq!(store.metrics_snapshot().leaves_issued, 3);
}

#[test]
fn cert_store_leaf_san_and_cn_cover_domain_and_ip() {
    let store =
        MitmCertificateStore::new(CertificateAuthorityConfig::default()).expect("cert store");

    let domain = store.get_leaf_cert("api.example.com").expect("domain leaf");
    assert_leaf_dns_name(domain.leaf_cert_der(), "api.example.com");
    assert_leaf_common_name(domain.leaf_cert_der(), "api.example.com");
    assert_leaf_issuer_common_name(domain.leaf_cert_der(), "sse-tap Local CA");

    let ip = store.get_leaf_cert("127.0.0.1").expect("ip leaf");
    assert_leaf_ip(ip.leaf_cert_der(), [127, 0, 0, 1]);
    assert_leaf_common_name(ip.leaf_cert_der(), "127.0.0.1");
}

#[test]
fn cert_store_persists_and_reloads_ca_from_disk() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let ca_cert_path = temp_dir.path().join("nested").join("ca-cert.pem");
    let ca_key_path = temp_dir.path().join("nested").join("ca-key.pem");

    let config = CertificateAuthorityConfig {
        ca_cert_pem_path: Some(path_to_string(&ca_cert_path)),
        ca_key_pem_path: Some(path_to_string(&ca_key_path)),
        ..CertificateAuthorityConfig::default()
    };

    let first_store = MitmCertificateStore::new(config.clone()).expect("first store");
    let first_ca = first_store.ca_certificate_pem().to_string();
    drop(first_store);
    assert!(ca_cert_path.exists());
    assert_eq!(
        fs::read_to_string(&ca_cert_path).expect("read persisted ca"),
        first_ca
    );

    let drifted = CertificateAuthorityConfig {
        ca_common_name: "drifted CA".to_string(),
        ..config
    };
    let second_store = MitmCertificateStore::new(drifted).expect("second store");
    assert_eq!(second_store.ca_certificate_pem(), first_ca);

    let leaf = second_store.get_leaf_cert("api.example.com").expect("leaf");
    assert_leaf_issuer_common_name(leaf.leaf_cert_der(), "sse-tap Local CA");
}

#[test]
fn cert_store_rejects_partial_ca_path_configuration() {
    let config = CertificateAuthorityConfig {
        ca_cert_pem_path: Some("/tmp/sse-tap-only-cert.pem".to_string()),
        ca_key_pem_path: None,
        ..CertificateAuthorityConfig::default()
    };
    let error = match MitmCertificateStore::new(config) {
        Ok(_) => panic!("partial CA path configuration unexpectedly succeeded"),
        Err(error) => error,
    };
    assert!(
        error
            .to_string()
            .contains("must either both be set or both be unset"),
        "{error}"
    );
}

#[test]
fn cert_store_rejects_half_present_ca_files() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let ca_cert_path = temp_dir.path().join("ca-cert.pem");
    let ca_key_path = temp_dir.path().join("ca-key.pem");
    fs::write(&ca_cert_path, "not a cert").expect("write stray cert");

    let config = CertificateAuthorityConfig {
        ca_cert_pem_path: Some(path_to_string(&ca_cert_path)),
        ca_key_pem_path: Some(path_to_string(&ca_key_path)),
        ..CertificateAuthorityConfig::default()
    };
    let error = match MitmCertificateStore::new(config) {
        Ok(_) => panic!("half-present CA files unexpectedly succeeded"),
        Err(error) => error,
    };
    assert!(error.to_string().contains("both exist"), "{error}");
}

fn assert_leaf_common_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .expect("commonName")
        .as_str()
        .expect("commonName as utf8");
    assert_eq!(cn, expected);
}

fn assert_leaf_issuer_common_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let cn = cert
        .issuer()
        .iter_common_name()
        .next()
        .expect("issuer commonName")
        .as_str()
        .expect("issuer commonName as utf8");
    assert_eq!(cn, expected);
}

fn assert_leaf_dns_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let san = cert
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    let found = san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::DNSName(value) if *value == expected));
    assert!(found, "expected SAN DNSName {expected}");
}

fn assert_leaf_ip(cert_der: &CertificateDer<'static>, expected: [u8; 4]) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let san = cert
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    let found = san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == expected));
    assert!(found, "expected SAN IPAddress {expected:?}");
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
