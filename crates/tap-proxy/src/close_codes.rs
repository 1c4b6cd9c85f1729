use tap_core::ProxyError;

/// Why a session ended, as reported in the `session closed` log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReasonCode {
    Completed,
    ClientClosed,
    UpstreamClosed,
    PeerDisconnect,
    IdleTimeout,
    RequestRejected,
    ConnectParseFailed,
    UpstreamConnectFailed,
    TlsHandshakeFailed,
    FramingError,
    TunnelEof,
    TunnelError,
    ExchangeError,
    Shutdown,
}

impl CloseReasonCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ClientClosed => "client_closed",
            Self::UpstreamClosed => "upstream_closed",
            Self::PeerDisconnect => "peer_disconnect",
            Self::IdleTimeout => "idle_timeout",
            Self::RequestRejected => "request_rejected",
            Self::ConnectParseFailed => "connect_parse_failed",
            Self::UpstreamConnectFailed => "upstream_connect_failed",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::FramingError => "framing_error",
            Self::TunnelEof => "tunnel_eof",
            Self::TunnelError => "tunnel_error",
            Self::ExchangeError => "exchange_error",
            Self::Shutdown => "shutdown",
        }
    }

    pub(crate) fn from_error(error: &ProxyError) -> Self {
        match error {
            ProxyError::Framing(_) | ProxyError::Io(_) if error.is_disconnect() => {
                Self::PeerDisconnect
            }
            ProxyError::Framing(_) => Self::FramingError,
            ProxyError::UpstreamConnect { .. } => Self::UpstreamConnectFailed,
            ProxyError::TlsHandshake { .. } => Self::TlsHandshakeFailed,
            ProxyError::Head(_) => Self::RequestRejected,
            ProxyError::IdleTimeout(_) => Self::IdleTimeout,
            ProxyError::UpstreamClosed => Self::UpstreamClosed,
            ProxyError::ClientClosed => Self::ClientClosed,
            ProxyError::Decode(_) | ProxyError::Io(_) => Self::ExchangeError,
        }
    }
}
