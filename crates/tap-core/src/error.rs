use std::io;

use tap_http::{is_idle_timeout, is_peer_disconnect, FramingError, HeadParseError, SseDecodeError};
use tap_tls::TlsFailureReason;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("upstream connect to {host}:{port} failed: {source}")]
    UpstreamConnect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake with {peer} failed ({}): {detail}", reason.code())]
    TlsHandshake {
        peer: String,
        reason: TlsFailureReason,
        detail: String,
    },
    #[error("malformed HTTP head: {0}")]
    Head(#[from] HeadParseError),
    #[error("event stream decode failed: {0}")]
    Decode(#[from] SseDecodeError),
    #[error("idle timeout: {0}")]
    IdleTimeout(String),
    #[error("client closed the connection")]
    ClientClosed,
    #[error("upstream closed the connection")]
    UpstreamClosed,
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ProxyError {
    fn from(error: io::Error) -> Self {
        if is_idle_timeout(&error) {
            return Self::IdleTimeout(error.to_string());
        }
        Self::Io(error)
    }
}

impl ProxyError {
    pub fn tls_handshake(peer: impl Into<String>, detail: impl ToString) -> Self {
        let detail = detail.to_string();
        Self::TlsHandshake {
            peer: peer.into(),
            reason: tap_tls::classify_tls_error(&detail),
            detail,
        }
    }

    /// Stable short code for logs and close reasons.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Framing(error) => error.code(),
            Self::UpstreamConnect { .. } => "upstream_connect_failed",
            Self::TlsHandshake { .. } => "tls_handshake_failed",
            Self::Head(error) => error.code(),
            Self::Decode(_) => "event_too_large",
            Self::IdleTimeout(_) => "idle_timeout",
            Self::ClientClosed => "client_closed",
            Self::UpstreamClosed => "upstream_closed",
            Self::Io(_) => "io",
        }
    }

    /// Peer went away or went quiet. These end a session without being
    /// reported as failures.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ClientClosed | Self::UpstreamClosed | Self::IdleTimeout(_) => true,
            Self::Io(error) => is_peer_disconnect(error),
            Self::Framing(FramingError::Io(error)) => {
                is_peer_disconnect(error) || is_idle_timeout(error)
            }
            _ => false,
        }
    }
}
