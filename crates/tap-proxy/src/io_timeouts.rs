use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tap_http::IO_CHUNK_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::Instant;

const CONNECT_TIMEOUT_ERROR_PREFIX: &str = "upstream_connect_timeout";
const HAPPY_EYEBALLS_STAGGER: Duration = Duration::from_millis(200);

pub(crate) fn timeout_error(prefix: &str, stage: &'static str, timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{prefix}:{stage}:{}ms", timeout.as_millis()),
    )
}

/// Errors raised while closing a connection the peer already dropped.
pub(crate) fn ignored_shutdown_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Disables Nagle on a proxied socket; a failure only costs latency.
pub(crate) fn enable_nodelay(stream: &TcpStream, side: &'static str) {
    if let Err(error) = stream.set_nodelay(true) {
        tracing::debug!(side, %error, "TCP_NODELAY not applied");
    }
}

/// How a blind tunnel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TunnelEnd {
    Closed { from_client: u64, from_server: u64 },
    Idle,
}

/// Copies both directions until each side has closed, or until no byte has
/// moved either way for `idle`.
pub(crate) async fn relay_tunnel(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    idle: Duration,
) -> io::Result<TunnelEnd> {
    let started = Instant::now();
    let last_activity_ms = AtomicU64::new(0);
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();
    let relay = async {
        tokio::try_join!(
            copy_half(&mut client_read, &mut upstream_write, started, &last_activity_ms),
            copy_half(&mut upstream_read, &mut client_write, started, &last_activity_ms),
        )
    };
    tokio::select! {
        copied = relay => {
            let (from_client, from_server) = copied?;
            Ok(TunnelEnd::Closed { from_client, from_server })
        }
        () = idle_watchdog(started, &last_activity_ms, idle) => Ok(TunnelEnd::Idle),
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    started: Instant,
    last_activity_ms: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0_u8; IO_CHUNK_SIZE];
    let mut copied = 0_u64;
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            match writer.shutdown().await {
                Err(error) if !ignored_shutdown_error(&error) => return Err(error),
                _ => return Ok(copied),
            }
        }
        writer.write_all(&buffer[..read]).await?;
        copied += read as u64;
        last_activity_ms.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

async fn idle_watchdog(started: Instant, last_activity_ms: &AtomicU64, idle: Duration) {
    loop {
        let last = started + Duration::from_millis(last_activity_ms.load(Ordering::Relaxed));
        let deadline = last + idle;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

/// Resolves `host` and races the resulting addresses, all under one deadline.
pub(crate) async fn connect_with_timeout(
    host: &str,
    port: u16,
    timeout: Duration,
    stage: &'static str,
) -> io::Result<TcpStream> {
    let timeout = if timeout.is_zero() {
        Duration::from_millis(1)
    } else {
        timeout
    };
    let deadline = Instant::now() + timeout;
    match connect_with_happy_eyeballs(host, port, deadline).await {
        Err(error) if error.kind() == io::ErrorKind::TimedOut => {
            Err(timeout_error(CONNECT_TIMEOUT_ERROR_PREFIX, stage, timeout))
        }
        result => result,
    }
}

async fn connect_with_happy_eyeballs(
    host: &str,
    port: u16,
    deadline: Instant,
) -> io::Result<TcpStream> {
    let addrs = resolve_upstream_socket_addrs(host, port, deadline).await?;
    connect_with_happy_eyeballs_addrs(addrs, deadline).await
}

async fn resolve_upstream_socket_addrs(
    host: &str,
    port: u16,
    deadline: Instant,
) -> io::Result<Vec<SocketAddr>> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let resolved = tokio::time::timeout(remaining, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, "upstream address resolution timed out")
        })?
        .map_err(|error| {
            io::Error::new(
                error.kind(),
                format!("upstream address resolution failed: {error}"),
            )
        })?;

    let addrs = interleave_address_families(resolved.collect());
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "upstream address resolution returned no socket addresses",
        ));
    }
    Ok(addrs)
}

/// Alternates address families, starting with IPv6 when any is present.
fn interleave_address_families(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let (ipv6, ipv4): (VecDeque<_>, VecDeque<_>) =
        addrs.into_iter().partition(SocketAddr::is_ipv6);
    let (mut first, mut second) = if ipv6.is_empty() {
        (ipv4, ipv6)
    } else {
        (ipv6, ipv4)
    };

    let mut ordered = Vec::with_capacity(first.len() + second.len());
    while !first.is_empty() || !second.is_empty() {
        if let Some(addr) = first.pop_front() {
            ordered.push(addr);
        }
        if let Some(addr) = second.pop_front() {
            ordered.push(addr);
        }
    }
    ordered
}

async fn connect_with_happy_eyeballs_addrs(
    addrs: Vec<SocketAddr>,
    deadline: Instant,
) -> io::Result<TcpStream> {
    let mut attempts = JoinSet::new();
    let mut start_at = Instant::now();
    for addr in addrs {
        let attempt_start = start_at;
        attempts.spawn(async move {
            tokio::time::sleep_until(attempt_start).await;
            TcpStream::connect(addr).await
        });
        start_at += HAPPY_EYEBALLS_STAGGER;
    }

    let mut last_error: Option<io::Error> = None;
    loop {
        let next = tokio::time::timeout_at(deadline, attempts.join_next()).await;
        match next {
            Ok(Some(Ok(Ok(stream)))) => {
                attempts.abort_all();
                enable_nodelay(&stream, "upstream");
                return Ok(stream);
            }
            Ok(Some(Ok(Err(error)))) => last_error = Some(error),
            Ok(Some(Err(join_error))) => {
                last_error = Some(io::Error::other(format!(
                    "upstream connect attempt join failed: {join_error}"
                )));
            }
            Ok(None) => break,
            Err(_) => {
                attempts.abort_all();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream connect timed out",
                ));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "all upstream connect attempts failed",
        )
    }))
}
