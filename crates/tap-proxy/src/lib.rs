//! Intercepting HTTP/1.1 proxy that decodes `text/event-stream` bodies in
//! flight and hands each event to the registered observers before the bytes
//! that carried it are forwarded.

mod close_codes;
mod exchange;
mod io_timeouts;
mod server;
mod session;
mod streams;
mod upstream;

pub use server::{MetricsHandle, ProxyServer, ServerError, ShutdownHandle};
pub use tap_core::{ProxyConfig, ProxyMetrics};
