use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tap_core::{
    ExchangeLifecycle, ExchangeSignal, ProxyConfig, ProxyError, ProxyMetricsStore,
};
use tap_http::{
    parse_request_head, parse_response_head, BodyFraming, BufferedConn, ConnWriter, FrameReader,
    RequestHead, ResponseHead, SseParser, StreamEvent,
};
use tap_observe::{Direction, ExchangeContext, ExchangeId, SessionDispatcher};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::close_codes::CloseReasonCode;
use crate::streams::{ClientStream, UpstreamStream};
use crate::upstream::{resolve_route, SessionMode, UpstreamConn, UpstreamConnector};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

pub(crate) struct ClientConn {
    pub(crate) reader: BufferedConn<ReadHalf<ClientStream>>,
    pub(crate) writer: ConnWriter<WriteHalf<ClientStream>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeOutcome {
    KeepAlive,
    Close(CloseReasonCode),
}

/// Drives request/response exchanges on one client connection until either
/// side ends it.
pub(crate) struct ExchangeLoop<'a> {
    pub(crate) session_id: u64,
    pub(crate) client_addr: &'a str,
    pub(crate) mode: SessionMode,
    pub(crate) config: &'a ProxyConfig,
    pub(crate) connector: &'a UpstreamConnector,
    pub(crate) dispatcher: &'a SessionDispatcher,
    pub(crate) metrics: &'a ProxyMetricsStore,
}

impl ExchangeLoop<'_> {
    /// `first_request` is a head the session already read off the client.
    pub(crate) async fn run(
        &self,
        client: &mut ClientConn,
        mut first_request: Option<RequestHead>,
    ) -> Result<CloseReasonCode, ProxyError> {
        let mut upstream: Option<UpstreamConn> = None;
        let mut sequence = 0_u64;
        loop {
            let request = match first_request.take() {
                Some(request) => request,
                None => {
                    let read = read_request_head(&mut client.reader, self.config.max_http_head_bytes)
                        .await;
                    match read {
                        Ok(Some(request)) => request,
                        Ok(None) => return Ok(CloseReasonCode::ClientClosed),
                        Err(error) => {
                            reject_request(client.writer.get_mut(), &error).await;
                            return Err(error);
                        }
                    }
                }
            };
            sequence += 1;
            let id = ExchangeId {
                session_id: self.session_id,
                sequence,
            };
            match self.run_exchange(client, &mut upstream, request, id).await? {
                ExchangeOutcome::KeepAlive => continue,
                ExchangeOutcome::Close(reason) => return Ok(reason),
            }
        }
    }

    async fn run_exchange(
        &self,
        client: &mut ClientConn,
        upstream_slot: &mut Option<UpstreamConn>,
        request: RequestHead,
        id: ExchangeId,
    ) -> Result<ExchangeOutcome, ProxyError> {
        let mut lifecycle = ExchangeLifecycle::new();
        advance(&mut lifecycle, ExchangeSignal::RequestHead);

        let resolved = match resolve_route(&request, &self.mode) {
            Ok(resolved) => resolved,
            Err(error) => {
                tracing::warn!(
                    exchange_id = %id,
                    code = error.code(),
                    %error,
                    "request rejected"
                );
                advance(&mut lifecycle, ExchangeSignal::Failure);
                self.metrics.mark_exchange_failed();
                write_proxy_response(
                    client.writer.get_mut(),
                    "400 Bad Request",
                    &format!("{}: {error}", error.code()),
                    true,
                )
                .await?;
                return Ok(ExchangeOutcome::Close(CloseReasonCode::RequestRejected));
            }
        };

        let exchange = Arc::new(ExchangeContext {
            id,
            client_addr: self.client_addr.to_string(),
            server_host: resolved.route.host.clone(),
            server_port: resolved.route.port,
            method: request.method.clone(),
            target: resolved.origin_target.clone(),
            intercepted_tls: resolved.route.tls,
        });
        let request_has_body = !FrameReader::new(request.framing, 1).is_complete();

        let reusable = upstream_slot
            .as_ref()
            .is_some_and(|conn| conn.route() == &resolved.route);
        if !reusable {
            *upstream_slot = None;
            match self.connector.connect(&resolved.route).await {
                Ok(conn) => *upstream_slot = Some(conn),
                Err(error) => {
                    advance(&mut lifecycle, ExchangeSignal::Failure);
                    return self
                        .answer_upstream_failure(client, &request, request_has_body, &exchange, error)
                        .await;
                }
            }
        }
        let Some(upstream) = upstream_slot.as_mut() else {
            return Err(ProxyError::UpstreamClosed);
        };

        upstream
            .writer
            .send(&request.encode_for_upstream(&resolved.origin_target))
            .await?;
        advance(&mut lifecycle, ExchangeSignal::RequestForwarded);
        tracing::debug!(
            exchange_id = %id,
            method = %request.method,
            target = %resolved.origin_target,
            upstream = %resolved.route.authority(),
            framing = request.framing.as_str(),
            "request forwarded"
        );

        let request_done = AtomicBool::new(!request_has_body);
        let relayed = {
            let request_side = self.relay_request_side(
                &mut client.reader,
                &mut upstream.writer,
                &request,
                &exchange,
                &request_done,
            );
            let response_side = self.relay_response_side(
                &mut upstream.reader,
                &mut client.writer,
                &request,
                &exchange,
                &mut lifecycle,
            );
            tokio::pin!(request_side, response_side);
            tokio::select! {
                result = &mut request_side => Err(result.err().unwrap_or(ProxyError::ClientClosed)),
                result = &mut response_side => result,
            }
        };

        let response = match relayed {
            Ok(response) => response,
            Err(error) => {
                advance(&mut lifecycle, ExchangeSignal::Failure);
                self.record_failure(&exchange, &error);
                *upstream_slot = None;
                return Err(error);
            }
        };

        advance(&mut lifecycle, ExchangeSignal::BodiesFinished);
        self.metrics.mark_exchange_completed();
        tracing::debug!(
            exchange_id = %id,
            status = response.status_code,
            event_stream = response.is_event_stream(),
            state = lifecycle.state().as_str(),
            "exchange complete"
        );

        if response.connection_close || response.status_code == 101 {
            *upstream_slot = None;
            return Ok(ExchangeOutcome::Close(CloseReasonCode::UpstreamClosed));
        }
        if request.connection_close || !request_done.load(Ordering::Acquire) {
            return Ok(ExchangeOutcome::Close(CloseReasonCode::Completed));
        }
        advance(&mut lifecycle, ExchangeSignal::NextRequest);
        Ok(ExchangeOutcome::KeepAlive)
    }

    async fn answer_upstream_failure(
        &self,
        client: &mut ClientConn,
        request: &RequestHead,
        request_has_body: bool,
        exchange: &ExchangeContext,
        error: ProxyError,
    ) -> Result<ExchangeOutcome, ProxyError> {
        match &error {
            ProxyError::TlsHandshake { .. } => self.metrics.mark_tls_handshake_failure(),
            _ => self.metrics.mark_upstream_connect_error(),
        }
        self.metrics.mark_exchange_failed();
        tracing::warn!(
            exchange_id = %exchange.id,
            upstream = %format!("{}:{}", exchange.server_host, exchange.server_port),
            code = error.code(),
            %error,
            "upstream connection failed"
        );

        // Keep the client only when nothing of this request is left unread.
        let keep_alive = !request.connection_close && !request_has_body;
        write_proxy_response(
            client.writer.get_mut(),
            "502 Bad Gateway",
            &format!("{}: {error}", error.code()),
            !keep_alive,
        )
        .await?;
        if keep_alive {
            Ok(ExchangeOutcome::KeepAlive)
        } else {
            Ok(ExchangeOutcome::Close(CloseReasonCode::UpstreamConnectFailed))
        }
    }

    /// Relays the request body, then watches the client until it goes away.
    /// Returning `Ok` means the client closed its side.
    async fn relay_request_side(
        &self,
        reader: &mut BufferedConn<ReadHalf<ClientStream>>,
        writer: &mut ConnWriter<WriteHalf<UpstreamStream>>,
        request: &RequestHead,
        exchange: &Arc<ExchangeContext>,
        done: &AtomicBool,
    ) -> Result<(), ProxyError> {
        let decoder = request
            .is_event_stream()
            .then(|| SseParser::with_max_event_bytes(self.config.max_event_bytes));
        self.relay_body(reader, writer, request.framing, decoder, Direction::Client, exchange)
            .await?;
        done.store(true, Ordering::Release);
        reader
            .wait_for_close(self.config.max_http_head_bytes)
            .await?;
        Ok(())
    }

    async fn relay_response_side(
        &self,
        reader: &mut BufferedConn<ReadHalf<UpstreamStream>>,
        writer: &mut ConnWriter<WriteHalf<ClientStream>>,
        request: &RequestHead,
        exchange: &Arc<ExchangeContext>,
        lifecycle: &mut ExchangeLifecycle,
    ) -> Result<ResponseHead, ProxyError> {
        let response = loop {
            let raw = reader
                .read_until_pattern(HEAD_TERMINATOR, self.config.max_http_head_bytes)
                .await?
                .ok_or(ProxyError::UpstreamClosed)?;
            let head = parse_response_head(&raw, &request.method)?;
            writer.send(&head.raw).await?;
            if head.is_interim() {
                advance(lifecycle, ExchangeSignal::InterimResponse);
                tracing::debug!(
                    exchange_id = %exchange.id,
                    status = head.status_code,
                    "interim response relayed"
                );
                continue;
            }
            break head;
        };
        advance(lifecycle, ExchangeSignal::ResponseHead);

        let decoder = response
            .is_event_stream()
            .then(|| SseParser::with_max_event_bytes(self.config.max_event_bytes));
        if decoder.is_some() {
            tracing::info!(
                exchange_id = %exchange.id,
                host = %exchange.server_host,
                target = %exchange.target,
                "event stream detected"
            );
        }
        if response.framing != BodyFraming::None {
            advance(lifecycle, ExchangeSignal::BodyStarted);
        }
        self.relay_body(reader, writer, response.framing, decoder, Direction::Server, exchange)
            .await?;
        Ok(response)
    }

    /// Moves one body from `reader` to `writer` frame by frame. Events decoded
    /// from a frame are published before the frame is written onward.
    async fn relay_body<R, W>(
        &self,
        reader: &mut BufferedConn<R>,
        writer: &mut ConnWriter<W>,
        framing: BodyFraming,
        mut decoder: Option<SseParser>,
        direction: Direction,
        exchange: &Arc<ExchangeContext>,
    ) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut frames = FrameReader::new(framing, self.config.max_frame_bytes);
        while let Some(frame) = frames.next_frame(reader).await? {
            if let Some(parser) = decoder.as_mut() {
                match parser.feed(&frame.payload) {
                    Ok(events) if events.is_empty() => {}
                    Ok(events) => self.publish_events(direction, exchange, events),
                    Err(failure) => {
                        if !failure.events.is_empty() {
                            self.publish_events(direction, exchange, failure.events);
                        }
                        tracing::warn!(
                            exchange_id = %exchange.id,
                            direction = direction.as_str(),
                            error = %failure.error,
                            "event stream decoding stopped, body is still relayed"
                        );
                        decoder = None;
                    }
                }
            }
            writer.send(&frame.wire).await?;
        }

        if let Some(mut parser) = decoder {
            if parser.finish() {
                tracing::debug!(
                    exchange_id = %exchange.id,
                    direction = direction.as_str(),
                    "unterminated event discarded at end of body"
                );
            }
        }
        Ok(())
    }

    fn publish_events(
        &self,
        direction: Direction,
        exchange: &Arc<ExchangeContext>,
        events: Vec<StreamEvent>,
    ) {
        self.metrics.add_events_decoded(events.len() as u64);
        self.dispatcher.publish(direction, exchange, events);
    }

    fn record_failure(&self, exchange: &ExchangeContext, error: &ProxyError) {
        if error.is_disconnect() {
            tracing::debug!(
                exchange_id = %exchange.id,
                code = error.code(),
                "exchange ended by disconnect"
            );
            return;
        }
        if matches!(error, ProxyError::Framing(_)) {
            self.metrics.mark_framing_error();
        }
        self.metrics.mark_exchange_failed();
        tracing::warn!(
            exchange_id = %exchange.id,
            code = error.code(),
            %error,
            "exchange failed"
        );
    }
}

fn advance(lifecycle: &mut ExchangeLifecycle, signal: ExchangeSignal) {
    if let Err(state) = lifecycle.advance(signal) {
        tracing::debug!(
            state = state.as_str(),
            ?signal,
            "ignored out-of-order exchange signal"
        );
    }
}

/// Reads and parses the next request head. `None` is a clean close between
/// requests.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufferedConn<S>,
    max_head_bytes: usize,
) -> Result<Option<RequestHead>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let Some(raw) = reader
        .read_until_pattern(HEAD_TERMINATOR, max_head_bytes)
        .await?
    else {
        return Ok(None);
    };
    Ok(Some(parse_request_head(&raw)?))
}

/// Status line sent to the client when a request head could not be accepted.
fn rejection_status(error: &ProxyError) -> Option<&'static str> {
    match error {
        ProxyError::Head(_) => Some("400 Bad Request"),
        ProxyError::Io(error) if error.kind() == io::ErrorKind::InvalidData => {
            Some("431 Request Header Fields Too Large")
        }
        _ => None,
    }
}

/// Answers a head that failed to read or parse, when an answer makes sense.
pub(crate) async fn reject_request<W>(stream: &mut W, error: &ProxyError)
where
    W: AsyncWrite + Unpin,
{
    let Some(status) = rejection_status(error) else {
        return;
    };
    tracing::warn!(code = error.code(), %error, "request head rejected");
    let body = format!("{}: {error}", error.code());
    if let Err(write_error) = write_proxy_response(stream, status, &body, true).await {
        tracing::debug!(%write_error, "failed to send rejection");
    }
}

pub(crate) async fn write_proxy_response<W>(
    stream: &mut W,
    status: &str,
    body: &str,
    close: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let connection = if close { "Connection: close\r\n" } else { "" };
    let response = format!(
        "HTTP/1.1 {status}\r\n{connection}Content-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
