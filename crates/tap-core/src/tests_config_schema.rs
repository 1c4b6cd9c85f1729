#[test]
fn default_config_is_valid() {
    let config = super::ProxyConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.idle_timeout(), std::time::Duration::from_secs(60));
    assert_eq!(config.shutdown_grace(), std::time::Duration::from_secs(5));
    assert_eq!(config.max_frame_bytes, 1024 * 1024);
}

#[test]
fn serde_round_trip_preserves_core_flags() {
    let json = r#"
        {
          "listen_address": "0.0.0.0:18080",
          "idle_timeout_seconds": 15,
          "observer_queue_depth": 0,
          "tls_intercept_enabled": false,
          "connect_parse_mode": "lenient",
          "passthrough_hosts": ["bank.example", "*.internal"]
        }
    "#;
    let parsed = super::ProxyConfig::from_json_str(json).expect("deserialize config");
    assert_eq!(parsed.listen_address, "0.0.0.0:18080");
    assert_eq!(parsed.idle_timeout_seconds, 15);
    assert_eq!(parsed.observer_queue_depth, 0);
    assert!(!parsed.tls_intercept_enabled);
    assert_eq!(parsed.connect_parse_mode, super::ConnectParseMode::Lenient);
    assert_eq!(parsed.max_frame_bytes, super::ProxyConfig::default().max_frame_bytes);

    let encoded = serde_json::to_string(&parsed).expect("serialize config");
    let reparsed = super::ProxyConfig::from_json_str(&encoded).expect("reparse config");
    assert_eq!(reparsed, parsed);
}

#[test]
fn serde_rejects_unknown_fields() {
    let json = r#"{ "unknown_field": true }"#;
    let err = super::ProxyConfig::from_json_str(json).expect_err("unknown field must fail");
    let message = err.to_string();
    assert!(
        message.contains("unknown field"),
        "expected unknown field error, got: {message}"
    );
}

#[test]
fn validation_rejects_partial_ca_path_pair() {
    let config = super::ProxyConfig {
        ca_cert_pem_path: Some("/tmp/ca.crt".to_string()),
        ca_key_pem_path: None,
        ..super::ProxyConfig::default()
    };
    let err = config.validate().expect_err("partial CA pair should fail");
    assert_eq!(err, super::ConfigError::InvalidCaPathPair);
}

#[test]
fn validation_rejects_zero_budgets() {
    let config = super::ProxyConfig {
        max_frame_bytes: 0,
        ..super::ProxyConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("zero frame budget"),
        super::ConfigError::ZeroValue("max_frame_bytes")
    );

    let config = super::ProxyConfig {
        idle_timeout_seconds: 0,
        ..super::ProxyConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("zero idle timeout"),
        super::ConfigError::ZeroValue("idle_timeout_seconds")
    );
}

#[test]
fn validation_rejects_empty_passthrough_entry() {
    let config = super::ProxyConfig {
        passthrough_hosts: vec!["ok.example".to_string(), " ".to_string()],
        ..super::ProxyConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("blank host"),
        super::ConfigError::EmptyHostEntry {
            field: "passthrough_hosts"
        }
    );
}

#[test]
fn passthrough_hosts_match_exact_and_wildcard_entries() {
    let config = super::ProxyConfig {
        passthrough_hosts: vec!["Bank.Example".to_string(), "*.internal".to_string()],
        ..super::ProxyConfig::default()
    };
    assert!(config.is_passthrough_host("bank.example"));
    assert!(config.is_passthrough_host("bank.example."));
    assert!(config.is_passthrough_host("api.internal"));
    assert!(!config.is_passthrough_host("internal"));
    assert!(!config.is_passthrough_host("notinternal"));
    assert!(!config.is_passthrough_host("www.bank.example"));
}

#[test]
fn certificate_authority_config_mirrors_proxy_fields() {
    let config = super::ProxyConfig {
        ca_cert_pem_path: Some("/tmp/ca.pem".to_string()),
        ca_key_pem_path: Some("/tmp/ca.key".to_string()),
        leaf_cert_cache_capacity: 7,
        ..super::ProxyConfig::default()
    };
    let ca = config.certificate_authority();
    assert_eq!(ca.ca_cert_pem_path.as_deref(), Some("/tmp/ca.pem"));
    assert_eq!(ca.ca_key_pem_path.as_deref(), Some("/tmp/ca.key"));
    assert_eq!(ca.leaf_cert_cache_capacity, 7);
    assert_eq!(ca.ca_common_name, config.ca_common_name);
}
