use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tap_core::{
    is_connect_method, parse_connect_target, ConnectTarget, ProxyConfig, ProxyError,
    ProxyMetricsStore,
};
use tap_http::{idle_timeout_error, BufferedConn, ConnWriter, Side, TlsState};
use tap_observe::{ObserverRegistry, SessionDispatcher};
use tap_tls::CertificateProvider;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::close_codes::CloseReasonCode;
use crate::exchange::{read_request_head, reject_request, write_proxy_response, ClientConn, ExchangeLoop};
use crate::io_timeouts::{
    connect_with_timeout, enable_nodelay, ignored_shutdown_error, relay_tunnel, timeout_error,
    TunnelEnd,
};
use crate::streams::{ClientStream, PrefixedStream};
use crate::upstream::{SessionMode, UpstreamConnector};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Handles shared by every session of one server.
pub(crate) struct SessionRuntime {
    pub(crate) config: ProxyConfig,
    pub(crate) metrics: Arc<ProxyMetricsStore>,
    pub(crate) registry: Arc<ObserverRegistry>,
    pub(crate) certificates: Arc<dyn CertificateProvider>,
    pub(crate) connector: UpstreamConnector,
}

#[derive(Debug, Clone)]
struct ConnectionMeta {
    session_id: u64,
    client_addr: String,
    client_tls: TlsState,
}

pub(crate) async fn run_session(
    runtime: Arc<SessionRuntime>,
    stream: TcpStream,
    client_addr: SocketAddr,
    session_id: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let _session_guard = runtime.metrics.begin_session();
    let mut meta = ConnectionMeta {
        session_id,
        client_addr: client_addr.to_string(),
        client_tls: TlsState::None,
    };
    let dispatcher = SessionDispatcher::new(
        Arc::clone(&runtime.registry),
        runtime.config.observer_queue_depth,
    );
    tracing::debug!(session_id, client = %meta.client_addr, "session opened");

    let result = tokio::select! {
        result = handle_session(&runtime, stream, &mut meta, &dispatcher) => result,
        _ = shutdown.wait_for(|stopping| *stopping) => Ok(CloseReasonCode::Shutdown),
    };
    let reason = match &result {
        Ok(reason) => *reason,
        Err(error) => CloseReasonCode::from_error(error),
    };
    if let Err(error) = &result {
        if !error.is_disconnect() {
            tracing::warn!(
                session_id,
                client = %meta.client_addr,
                code = error.code(),
                %error,
                "session failed"
            );
        }
    }

    let report = dispatcher
        .close_and_drain(runtime.config.shutdown_grace())
        .await;
    runtime.metrics.add_events_dropped(report.dropped());
    if report.timed_out {
        tracing::warn!(session_id, "observer queues did not drain before the grace period");
    }
    tracing::info!(
        session_id,
        client = %meta.client_addr,
        reason = reason.as_str(),
        client_tls = meta.client_tls.as_str(),
        dropped_events = report.dropped(),
        "session closed"
    );
}

async fn handle_session(
    runtime: &SessionRuntime,
    stream: TcpStream,
    meta: &mut ConnectionMeta,
    dispatcher: &SessionDispatcher,
) -> Result<CloseReasonCode, ProxyError> {
    let config = &runtime.config;
    enable_nodelay(&stream, "client");
    let mut reader =
        BufferedConn::new(stream, Side::Client).with_idle_timeout(Some(config.idle_timeout()));
    let request = match read_request_head(&mut reader, config.max_http_head_bytes).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(CloseReasonCode::ClientClosed),
        Err(error) => {
            reject_request(reader.get_mut(), &error).await;
            return Err(error);
        }
    };

    if !is_connect_method(&request.method, config.connect_parse_mode) {
        let (stream, leftover) = reader.into_parts();
        let client_stream = ClientStream::Plain {
            stream: PrefixedStream::new(Bytes::new(), stream),
        };
        let mut client = client_conn(client_stream, &leftover, config);
        let result = exchange_loop(runtime, meta, dispatcher, SessionMode::Forward)
            .run(&mut client, Some(request))
            .await;
        close_client(&mut client.writer).await;
        return result;
    }

    let target = match parse_connect_target(&request.target, config.connect_parse_mode) {
        Ok(target) => target,
        Err(error) => {
            tracing::warn!(
                session_id = meta.session_id,
                code = error.code(),
                target = %request.target,
                "CONNECT target rejected"
            );
            write_proxy_response(
                reader.get_mut(),
                "400 Bad Request",
                &format!("invalid CONNECT request: {}", error.code()),
                true,
            )
            .await?;
            return Ok(CloseReasonCode::ConnectParseFailed);
        }
    };

    let (mut stream, leftover) = reader.into_parts();
    if !config.tls_intercept_enabled || config.is_passthrough_host(&target.host) {
        return tunnel_blind(runtime, meta, &target, stream, leftover).await;
    }

    stream.write_all(CONNECT_ESTABLISHED).await?;
    let first_byte = match leftover.first() {
        Some(byte) => Some(*byte),
        None => peek_first_byte(&stream, config.idle_timeout()).await?,
    };
    let Some(first_byte) = first_byte else {
        return Ok(CloseReasonCode::ClientClosed);
    };

    let prefixed = PrefixedStream::new(leftover, stream);
    let client_stream = if first_byte == TLS_HANDSHAKE_RECORD {
        meta.client_tls = TlsState::Handshaking;
        let stream = accept_client_tls(runtime, meta, &target, prefixed).await?;
        meta.client_tls = TlsState::Established;
        ClientStream::Tls { stream }
    } else {
        ClientStream::Plain { stream: prefixed }
    };
    tracing::debug!(
        session_id = meta.session_id,
        target = %target,
        client_tls = meta.client_tls.as_str(),
        "CONNECT tunnel intercepted"
    );

    let tls = client_stream.is_tls();
    let mut client = client_conn(client_stream, &[], config);
    let result = exchange_loop(runtime, meta, dispatcher, SessionMode::Tunnel { target, tls })
        .run(&mut client, None)
        .await;
    close_client(&mut client.writer).await;
    result
}

fn exchange_loop<'a>(
    runtime: &'a SessionRuntime,
    meta: &'a ConnectionMeta,
    dispatcher: &'a SessionDispatcher,
    mode: SessionMode,
) -> ExchangeLoop<'a> {
    ExchangeLoop {
        session_id: meta.session_id,
        client_addr: &meta.client_addr,
        mode,
        config: &runtime.config,
        connector: &runtime.connector,
        dispatcher,
        metrics: &runtime.metrics,
    }
}

fn client_conn(stream: ClientStream, leftover: &[u8], config: &ProxyConfig) -> ClientConn {
    let (read_half, write_half) = tokio::io::split(stream);
    ClientConn {
        reader: BufferedConn::new(read_half, Side::Client)
            .with_idle_timeout(Some(config.idle_timeout()))
            .with_prefix(leftover),
        writer: ConnWriter::new(write_half, Side::Client),
    }
}

/// Flushes and closes the client side so close-delimited bodies end cleanly.
async fn close_client<W>(writer: &mut ConnWriter<W>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match tokio::time::timeout(CLIENT_CLOSE_TIMEOUT, writer.shutdown()).await {
        Ok(Err(error)) if !ignored_shutdown_error(&error) => {
            tracing::debug!(%error, "client shutdown failed");
        }
        _ => {}
    }
}

async fn peek_first_byte(stream: &TcpStream, idle: Duration) -> Result<Option<u8>, ProxyError> {
    let mut byte = [0_u8; 1];
    let read = tokio::time::timeout(idle, stream.peek(&mut byte))
        .await
        .map_err(|_| idle_timeout_error(Side::Client, idle))??;
    Ok((read == 1).then_some(byte[0]))
}

async fn accept_client_tls(
    runtime: &SessionRuntime,
    meta: &ConnectionMeta,
    target: &ConnectTarget,
    stream: PrefixedStream<TcpStream>,
) -> Result<TlsStream<PrefixedStream<TcpStream>>, ProxyError> {
    let leaf = runtime
        .certificates
        .get_leaf_cert(&target.host)
        .map_err(|error| {
            runtime.metrics.mark_tls_handshake_failure();
            ProxyError::tls_handshake(
                meta.client_addr.clone(),
                format!("leaf issuance for {} failed: {error}", target.host),
            )
        })?;
    tracing::debug!(
        session_id = meta.session_id,
        host = %leaf.host,
        cache = leaf.cache_status.as_str(),
        "leaf certificate ready"
    );

    let acceptor = TlsAcceptor::from(Arc::clone(&leaf.server_config));
    let idle = runtime.config.idle_timeout();
    let accepted = match tokio::time::timeout(idle, acceptor.accept(stream)).await {
        Ok(accepted) => accepted,
        Err(_) => Err(timeout_error("client_tls", "handshake", idle)),
    };
    accepted.map_err(|error| {
        runtime.metrics.mark_tls_handshake_failure();
        ProxyError::tls_handshake(meta.client_addr.clone(), error)
    })
}

/// Relays a `CONNECT` tunnel without looking inside it. The tunnel is torn
/// down once neither side has sent anything for the idle timeout.
async fn tunnel_blind(
    runtime: &SessionRuntime,
    meta: &ConnectionMeta,
    target: &ConnectTarget,
    mut stream: TcpStream,
    leftover: Bytes,
) -> Result<CloseReasonCode, ProxyError> {
    let connect_timeout = runtime.config.upstream_connect_timeout();
    let mut upstream =
        match connect_with_timeout(&target.host, target.port, connect_timeout, "tunnel_tcp").await {
            Ok(upstream) => upstream,
            Err(source) => {
                runtime.metrics.mark_upstream_connect_error();
                let error = ProxyError::UpstreamConnect {
                    host: target.host.clone(),
                    port: target.port,
                    source,
                };
                write_proxy_response(
                    &mut stream,
                    "502 Bad Gateway",
                    &format!("{}: {error}", error.code()),
                    true,
                )
                .await?;
                return Err(error);
            }
        };

    stream.write_all(CONNECT_ESTABLISHED).await?;
    if !leftover.is_empty() {
        upstream.write_all(&leftover).await?;
    }
    runtime.metrics.mark_passthrough_tunnel();
    tracing::debug!(session_id = meta.session_id, target = %target, "blind tunnel opened");

    let idle = runtime.config.idle_timeout();
    match relay_tunnel(&mut stream, &mut upstream, idle).await {
        Ok(TunnelEnd::Closed {
            from_client,
            from_server,
        }) => {
            tracing::debug!(
                session_id = meta.session_id,
                from_client,
                from_server,
                "blind tunnel finished"
            );
            Ok(CloseReasonCode::TunnelEof)
        }
        Ok(TunnelEnd::Idle) => {
            tracing::debug!(
                session_id = meta.session_id,
                idle_ms = idle.as_millis() as u64,
                "blind tunnel idle, closing"
            );
            Ok(CloseReasonCode::IdleTimeout)
        }
        Err(error) if ignored_shutdown_error(&error) => Ok(CloseReasonCode::TunnelEof),
        Err(error) => {
            tracing::warn!(session_id = meta.session_id, %error, "blind tunnel failed");
            Ok(CloseReasonCode::TunnelError)
        }
    }
}
