use std::time::Duration;

use serde::{Deserialize, Serialize};
use tap_tls::CertificateAuthorityConfig;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectParseMode {
    #[default]
    Strict,
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen_address: String,
    pub idle_timeout_seconds: u64,
    pub max_frame_bytes: usize,
    /// Pending events per observer per session. `0` dispatches inline.
    pub observer_queue_depth: usize,
    pub tls_intercept_enabled: bool,
    pub connect_parse_mode: ConnectParseMode,
    pub max_http_head_bytes: usize,
    pub max_event_bytes: usize,
    pub max_concurrent_sessions: usize,
    pub upstream_connect_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub passthrough_hosts: Vec<String>,
    pub upstream_tls_insecure_skip_verify: bool,
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub leaf_cert_cache_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_string(),
            idle_timeout_seconds: 60,
            max_frame_bytes: tap_http::DEFAULT_MAX_FRAME_BYTES,
            observer_queue_depth: 1024,
            tls_intercept_enabled: true,
            connect_parse_mode: ConnectParseMode::Strict,
            max_http_head_bytes: 64 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
            max_concurrent_sessions: 2048,
            upstream_connect_timeout_seconds: 10,
            shutdown_grace_seconds: 5,
            passthrough_hosts: Vec::new(),
            upstream_tls_insecure_skip_verify: false,
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            ca_common_name: "sse-tap Local CA".to_string(),
            ca_organization: "sse-tap".to_string(),
            leaf_cert_cache_capacity: 1024,
        }
    }
}

impl ProxyConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config = serde_json::from_str::<Self>(json)
            .map_err(|error| ConfigError::Parse(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_string(),
            reason: error.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddress);
        }
        if self.idle_timeout_seconds == 0 {
            return Err(ConfigError::ZeroValue("idle_timeout_seconds"));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::ZeroValue("max_frame_bytes"));
        }
        if self.max_http_head_bytes == 0 {
            return Err(ConfigError::ZeroValue("max_http_head_bytes"));
        }
        if self.max_event_bytes == 0 {
            return Err(ConfigError::ZeroValue("max_event_bytes"));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::ZeroValue("max_concurrent_sessions"));
        }
        if self.upstream_connect_timeout_seconds == 0 {
            return Err(ConfigError::ZeroValue("upstream_connect_timeout_seconds"));
        }
        if self.leaf_cert_cache_capacity == 0 {
            return Err(ConfigError::ZeroValue("leaf_cert_cache_capacity"));
        }
        if self.ca_cert_pem_path.is_some() != self.ca_key_pem_path.is_some() {
            return Err(ConfigError::InvalidCaPathPair);
        }
        require_non_empty(&self.ca_common_name, ConfigError::EmptyCaCommonName)?;
        require_non_empty(&self.ca_organization, ConfigError::EmptyCaOrganization)?;
        validate_host_list(&self.passthrough_hosts, "passthrough_hosts")?;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn certificate_authority(&self) -> CertificateAuthorityConfig {
        CertificateAuthorityConfig {
            ca_cert_pem_path: self.ca_cert_pem_path.clone(),
            ca_key_pem_path: self.ca_key_pem_path.clone(),
            ca_common_name: self.ca_common_name.clone(),
            ca_organization: self.ca_organization.clone(),
            leaf_cert_cache_capacity: self.leaf_cert_cache_capacity,
        }
    }

    /// True when CONNECT tunnels to `host` must be relayed without
    /// interception. Entries match the host itself or, with a leading `*.`
    /// or `.`, any subdomain.
    pub fn is_passthrough_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.passthrough_hosts.iter().any(|entry| {
            let entry = entry.trim().trim_end_matches('.').to_ascii_lowercase();
            match entry
                .strip_prefix("*.")
                .or_else(|| entry.strip_prefix('.'))
            {
                Some(suffix) => host
                    .strip_suffix(suffix)
                    .is_some_and(|prefix| prefix.ends_with('.')),
                None => host == entry,
            }
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("listen_address must not be empty")]
    EmptyListenAddress,
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("ca_cert_pem_path and ca_key_pem_path must be provided together")]
    InvalidCaPathPair,
    #[error("ca_common_name must not be empty")]
    EmptyCaCommonName,
    #[error("ca_organization must not be empty")]
    EmptyCaOrganization,
    #[error("{field} contains an empty host entry")]
    EmptyHostEntry { field: &'static str },
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
}

fn validate_host_list(hosts: &[String], field: &'static str) -> Result<(), ConfigError> {
    if hosts.iter().any(|host| host.trim().is_empty()) {
        return Err(ConfigError::EmptyHostEntry { field });
    }
    Ok(())
}

fn require_non_empty(value: &str, error: ConfigError) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(error);
    }
    Ok(())
}
