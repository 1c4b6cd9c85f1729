use std::sync::Arc;
use std::time::Duration;

use http::uri::{Authority, Uri};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tap_core::{ConnectTarget, ProxyError};
use tap_http::{BufferedConn, ConnWriter, RequestHead, Side};
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_rustls::TlsConnector;

use crate::io_timeouts::{connect_with_timeout, timeout_error};
use crate::streams::UpstreamStream;

/// Where one exchange is sent: host, port and whether the hop uses TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tls: bool,
}

impl Route {
    pub(crate) fn authority(&self) -> String {
        ConnectTarget {
            host: self.host.clone(),
            port: self.port,
        }
        .authority()
    }
}

/// How the client reached the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionMode {
    /// Plaintext forward proxying; every request names its own origin.
    Forward,
    /// Requests arrive inside an intercepted `CONNECT` tunnel.
    Tunnel { target: ConnectTarget, tls: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedRequest {
    pub(crate) route: Route,
    pub(crate) origin_target: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub(crate) enum RouteError {
    #[error("request target was not a valid URI")]
    InvalidTarget,
    #[error("https absolute-form requires CONNECT")]
    HttpsWithoutConnect,
    #[error("only http absolute-form is supported for cleartext proxying")]
    UnsupportedScheme,
    #[error("origin-form request missing Host header")]
    MissingHost,
    #[error("Host header was not a valid authority")]
    InvalidHost,
}

impl RouteError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            Self::InvalidTarget => "invalid_target",
            Self::HttpsWithoutConnect => "https_without_connect",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::MissingHost => "missing_host",
            Self::InvalidHost => "invalid_host",
        }
    }
}

pub(crate) fn resolve_route(
    request: &RequestHead,
    mode: &SessionMode,
) -> Result<ResolvedRequest, RouteError> {
    match mode {
        SessionMode::Tunnel { target, tls } => Ok(ResolvedRequest {
            route: Route {
                host: target.host.clone(),
                port: target.port,
                tls: *tls,
            },
            origin_target: origin_form_target(&request.target)?,
        }),
        SessionMode::Forward if is_absolute_form(&request.target) => {
            resolve_absolute_form(&request.target)
        }
        SessionMode::Forward => resolve_origin_form(request),
    }
}

fn is_absolute_form(target: &str) -> bool {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn resolve_absolute_form(target: &str) -> Result<ResolvedRequest, RouteError> {
    let uri = target
        .parse::<Uri>()
        .map_err(|_| RouteError::InvalidTarget)?;
    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => {
            return Err(RouteError::HttpsWithoutConnect)
        }
        _ => return Err(RouteError::UnsupportedScheme),
    }
    let host = uri.host().ok_or(RouteError::InvalidTarget)?;
    Ok(ResolvedRequest {
        route: Route {
            host: normalize_host(host),
            port: uri.port_u16().unwrap_or(80),
            tls: false,
        },
        origin_target: path_and_query(&uri),
    })
}

fn resolve_origin_form(request: &RequestHead) -> Result<ResolvedRequest, RouteError> {
    let host_header = request.header("host").ok_or(RouteError::MissingHost)?;
    let authority = host_header
        .trim()
        .parse::<Authority>()
        .map_err(|_| RouteError::InvalidHost)?;
    Ok(ResolvedRequest {
        route: Route {
            host: normalize_host(authority.host()),
            port: authority.port_u16().unwrap_or(80),
            tls: false,
        },
        origin_target: origin_form_target(&request.target)?,
    })
}

/// Target as sent upstream: absolute-form is reduced to path and query.
fn origin_form_target(target: &str) -> Result<String, RouteError> {
    if target.starts_with('/') || target == "*" {
        return Ok(target.to_string());
    }
    if is_absolute_form(target) {
        let uri = target
            .parse::<Uri>()
            .map_err(|_| RouteError::InvalidTarget)?;
        return Ok(path_and_query(&uri));
    }
    Err(RouteError::InvalidTarget)
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("/")
        .to_string()
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// One upstream connection split into its buffered read half and writer.
pub(crate) struct UpstreamConn {
    route: Route,
    pub(crate) reader: BufferedConn<ReadHalf<UpstreamStream>>,
    pub(crate) writer: ConnWriter<WriteHalf<UpstreamStream>>,
}

impl UpstreamConn {
    pub(crate) fn route(&self) -> &Route {
        &self.route
    }
}

/// Opens upstream connections with the session's timeouts and TLS settings.
#[derive(Clone)]
pub(crate) struct UpstreamConnector {
    pub(crate) tls_config: Arc<ClientConfig>,
    pub(crate) connect_timeout: Duration,
    pub(crate) idle_timeout: Duration,
}

impl UpstreamConnector {
    pub(crate) async fn connect(&self, route: &Route) -> Result<UpstreamConn, ProxyError> {
        let tcp = connect_with_timeout(
            &route.host,
            route.port,
            self.connect_timeout,
            "upstream_tcp",
        )
        .await
        .map_err(|source| ProxyError::UpstreamConnect {
            host: route.host.clone(),
            port: route.port,
            source,
        })?;

        let stream = if route.tls {
            let server_name = ServerName::try_from(route.host.clone())
                .map_err(|error| ProxyError::tls_handshake(route.authority(), error))?;
            let connector = TlsConnector::from(Arc::clone(&self.tls_config));
            let handshake = connector.connect(server_name, tcp);
            let tls = tokio::time::timeout(self.connect_timeout, handshake)
                .await
                .map_err(|_| {
                    ProxyError::tls_handshake(
                        route.authority(),
                        timeout_error("upstream_tls", "handshake", self.connect_timeout),
                    )
                })?
                .map_err(|error| ProxyError::tls_handshake(route.authority(), error))?;
            UpstreamStream::Tls { stream: tls }
        } else {
            UpstreamStream::Plain { stream: tcp }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        tracing::debug!(
            upstream = %route.authority(),
            tls = route.tls,
            "upstream connection established"
        );
        Ok(UpstreamConn {
            route: route.clone(),
            reader: BufferedConn::new(read_half, Side::Upstream)
                .with_idle_timeout(Some(self.idle_timeout)),
            writer: ConnWriter::new(write_half, Side::Upstream),
        })
    }
}
