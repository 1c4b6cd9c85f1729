//! Proxy-wide building blocks shared by the server crate: configuration,
//! the error taxonomy, `CONNECT` target parsing, the per-exchange state
//! machine and session metrics.

mod config;
mod connect;
mod error;
mod exchange_state;
mod metrics;

pub use config::{ConfigError, ConnectParseMode, ProxyConfig};
pub use connect::{
    is_connect_method, parse_connect_request_line, parse_connect_target, ConnectParseError,
    ConnectTarget,
};
pub use error::ProxyError;
pub use exchange_state::{next_exchange_state, ExchangeLifecycle, ExchangeSignal, ExchangeState};
pub use metrics::{ProxyMetrics, ProxyMetricsStore, SessionMetricsGuard};

#[cfg(test)]
mod tests {
    include!("tests_config_schema.rs");
    include!("tests_connect_parser.rs");
}
