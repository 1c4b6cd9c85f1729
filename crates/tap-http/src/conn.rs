use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Which peer a connection handle faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    None,
    Handshaking,
    Established,
}

impl TlsState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Handshaking => "handshaking",
            Self::Established => "established",
        }
    }
}

/// Read half of a proxied connection with a carry-over buffer.
///
/// Bytes pulled off the stream land in `read_buf` first; head parsing and
/// body framing consume from there so that nothing read past a message
/// boundary is lost. Every read is bounded by the optional idle timeout.
#[derive(Debug)]
pub struct BufferedConn<S> {
    stream: S,
    read_buf: BytesMut,
    side: Side,
    idle_timeout: Option<Duration>,
    bytes_read: u64,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S, side: Side) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(IO_CHUNK_SIZE),
            side,
            idle_timeout: None,
            bytes_read: 0,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    /// Seeds the buffer with bytes that were read before this handle existed.
    pub fn with_prefix(mut self, prefix: &[u8]) -> Self {
        self.read_buf.extend_from_slice(prefix);
        self
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Total bytes pulled from the underlying stream.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_parts(self) -> (S, Bytes) {
        (self.stream, self.read_buf.freeze())
    }

    pub fn take_buffered(&mut self, max: usize) -> Bytes {
        let take = max.min(self.read_buf.len());
        self.read_buf.split_to(take).freeze()
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    /// Reads once from the stream into the buffer. Returns 0 on EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.read_buf.reserve(IO_CHUNK_SIZE);
        let read = match self.idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| idle_timeout_error(self.side, timeout))??,
            None => self.stream.read_buf(&mut self.read_buf).await?,
        };
        self.bytes_read += read as u64;
        Ok(read)
    }

    /// Returns bytes up to and including `pattern`, `None` on a clean EOF
    /// before any byte of the next message arrived.
    pub async fn read_until_pattern(
        &mut self,
        pattern: &[u8],
        max_bytes: usize,
    ) -> io::Result<Option<Bytes>> {
        let mut searched = 0;
        loop {
            if let Some(start) = find_subsequence(&self.read_buf[searched..], pattern) {
                let end = searched + start + pattern.len();
                return Ok(Some(self.read_buf.split_to(end).freeze()));
            }
            searched = self.read_buf.len().saturating_sub(pattern.len().saturating_sub(1));

            if self.read_buf.len() > max_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message head exceeded configured limit",
                ));
            }

            if self.fill().await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message boundary was reached",
                ));
            }
        }
    }

    pub async fn read_exact_bytes(&mut self, exact_len: usize) -> io::Result<Bytes> {
        while self.read_buf.len() < exact_len {
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before fixed-length read completed",
                ));
            }
        }
        Ok(self.read_buf.split_to(exact_len).freeze())
    }

    /// Returns whatever is available, up to `max` bytes. `None` means EOF.
    pub async fn read_some(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        if self.read_buf.is_empty() && self.fill().await? == 0 {
            return Ok(None);
        }
        Ok(Some(self.take_buffered(max)))
    }

    /// Resolves once the peer closes its write side. Early bytes of a
    /// pipelined request stay buffered; the idle timeout does not apply. Past
    /// `max_buffered` bytes the connection is no longer read and this never
    /// resolves.
    pub async fn wait_for_close(&mut self, max_buffered: usize) -> io::Result<()> {
        while self.read_buf.len() < max_buffered {
            self.read_buf.reserve(IO_CHUNK_SIZE);
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Ok(());
            }
            self.bytes_read += read as u64;
        }
        std::future::pending().await
    }
}

/// Write half of a proxied connection that tracks its write cursor.
#[derive(Debug)]
pub struct ConnWriter<W> {
    stream: W,
    side: Side,
    bytes_written: u64,
}

impl<W> ConnWriter<W> {
    pub fn new(stream: W, side: Side) -> Self {
        Self {
            stream,
            side,
            bytes_written: 0,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.stream
    }
}

impl<W: AsyncWrite + Unpin> ConnWriter<W> {
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Writes and flushes so streamed bodies reach the peer without delay.
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes).await?;
        self.stream.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

pub fn idle_timeout_error(side: Side, timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("idle_timeout:{}:{}ms", side.as_str(), timeout.as_millis()),
    )
}

pub fn is_idle_timeout(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::TimedOut && error.to_string().starts_with("idle_timeout:")
}

/// Disconnect flavours that count as a normal peer close.
pub fn is_peer_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::{is_idle_timeout, BufferedConn, ConnWriter, Side};

    #[tokio::test]
    async fn read_until_pattern_keeps_bytes_past_the_boundary() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(b"GET / HTTP/1.1\r\n\r\nleftover")
            .await
            .expect("write");
        drop(client);

        let mut conn = BufferedConn::new(server, Side::Client);
        let head = conn
            .read_until_pattern(b"\r\n\r\n", 1024)
            .await
            .expect("read head")
            .expect("head present");
        assert_eq!(&head[..], b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(conn.buffered(), b"leftover");
        assert_eq!(conn.bytes_read(), 26);
    }

    #[tokio::test]
    async fn read_until_pattern_returns_none_on_clean_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut conn = BufferedConn::new(server, Side::Upstream);
        let head = conn.read_until_pattern(b"\r\n\r\n", 1024).await.expect("eof");
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn read_until_pattern_enforces_limit() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(&[b'a'; 128]).await.expect("write");
        let mut conn = BufferedConn::new(server, Side::Client);
        let error = conn
            .read_until_pattern(b"\r\n\r\n", 64)
            .await
            .expect_err("limit must trip");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn idle_timeout_surfaces_as_timed_out() {
        let (_client, server) = tokio::io::duplex(64);
        let mut conn = BufferedConn::new(server, Side::Upstream)
            .with_idle_timeout(Some(Duration::from_millis(20)));
        let error = conn.fill().await.expect_err("must time out");
        assert!(is_idle_timeout(&error), "{error}");
    }

    #[tokio::test]
    async fn wait_for_close_keeps_pipelined_bytes_and_ignores_idle_timeout() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut conn = BufferedConn::new(server, Side::Client)
            .with_idle_timeout(Some(Duration::from_millis(10)));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.write_all(b"GET /next").await.expect("write");
            drop(client);
        });
        conn.wait_for_close(1024).await.expect("clean close");
        writer.await.expect("writer task");
        assert_eq!(conn.buffered(), b"GET /next");
    }

    #[tokio::test]
    async fn writer_counts_written_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut writer = ConnWriter::new(client, Side::Client);
        writer.send(b"hello").await.expect("send");
        writer.write_all(b" world").await.expect("write");
        assert_eq!(writer.bytes_written(), 11);
        drop(writer);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut out)
            .await
            .expect("read");
        assert_eq!(out, b"hello world");
    }
}
