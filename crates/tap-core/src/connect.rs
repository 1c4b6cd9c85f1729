use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use crate::ConnectParseMode;

const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Destination named by a `CONNECT` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectParseError {
    #[error("empty request line")]
    EmptyRequestLine,
    #[error("request line must have method, target and version")]
    InvalidRequestLine,
    #[error("method is not CONNECT")]
    MethodNotConnect,
    #[error("invalid HTTP version")]
    InvalidHttpVersion,
    #[error("invalid CONNECT authority")]
    InvalidAuthority,
    #[error("CONNECT authority has no port")]
    MissingPort,
    #[error("CONNECT port is not a valid u16")]
    InvalidPort,
}

impl ConnectParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::EmptyRequestLine => "empty_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::MethodNotConnect => "method_not_connect",
            Self::InvalidHttpVersion => "invalid_http_version",
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
        }
    }
}

pub fn is_connect_method(method: &str, mode: ConnectParseMode) -> bool {
    match mode {
        ConnectParseMode::Strict => method == "CONNECT",
        ConnectParseMode::Lenient => method.eq_ignore_ascii_case("CONNECT"),
    }
}

pub fn parse_connect_request_line(
    request_line: &str,
    mode: ConnectParseMode,
) -> Result<ConnectTarget, ConnectParseError> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ConnectParseError::EmptyRequestLine)?;
    let target = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(ConnectParseError::InvalidRequestLine);
    }
    if !is_connect_method(method, mode) {
        return Err(ConnectParseError::MethodNotConnect);
    }
    if !version.starts_with("HTTP/") {
        return Err(ConnectParseError::InvalidHttpVersion);
    }
    parse_connect_target(target, mode)
}

/// Parses the request-target of a `CONNECT`. Strict mode wants
/// `host:port` or `[v6]:port`; lenient mode also takes a missing port
/// (443) and absolute-form URLs.
pub fn parse_connect_target(
    target: &str,
    mode: ConnectParseMode,
) -> Result<ConnectTarget, ConnectParseError> {
    let authority = match mode {
        ConnectParseMode::Strict => target,
        ConnectParseMode::Lenient => strip_to_authority(target),
    };
    let lenient = mode == ConnectParseMode::Lenient;

    let (host, port_text) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, suffix) = rest
            .split_once(']')
            .ok_or(ConnectParseError::InvalidAuthority)?;
        let port_text = match suffix {
            "" => None,
            _ => Some(
                suffix
                    .strip_prefix(':')
                    .ok_or(ConnectParseError::MissingPort)?,
            ),
        };
        (host, port_text)
    } else {
        match authority.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => {
                if lenient && authority.parse::<IpAddr>().is_ok() {
                    (authority, None)
                } else {
                    return Err(ConnectParseError::InvalidAuthority);
                }
            }
            Some((host, port_text)) => (host, Some(port_text)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(ConnectParseError::InvalidAuthority);
    }
    let port = match port_text {
        Some(text) if !text.is_empty() => text
            .parse::<u16>()
            .map_err(|_| ConnectParseError::InvalidPort)?,
        _ if lenient => DEFAULT_TUNNEL_PORT,
        _ => return Err(ConnectParseError::MissingPort),
    };

    Ok(ConnectTarget {
        host: host.to_string(),
        port,
    })
}

fn strip_to_authority(target: &str) -> &str {
    let trimmed = target.trim();
    let without_scheme = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .trim()
}
