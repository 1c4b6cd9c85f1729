use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::conn::{BufferedConn, IO_CHUNK_SIZE};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;
const TRAILER_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

impl BodyFraming {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ContentLength(_) => "content_length",
            Self::Chunked => "chunked",
            Self::CloseDelimited => "close_delimited",
        }
    }
}

/// One decoded body segment.
///
/// `payload` is the de-chunked content, `wire` the exact bytes consumed from
/// the connection to produce it (chunk-size line and CRLF included), so the
/// proxy can relay the body byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub wire: Bytes,
    pub last: bool,
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("connection closed after {received} body bytes, {missing} still expected")]
    TruncatedBody { received: u64, missing: u64 },
    #[error("connection closed inside a chunked body after {received} bytes")]
    TruncatedChunkedBody { received: u64 },
    #[error("malformed chunk: {0}")]
    MalformedChunk(&'static str),
    #[error("chunk of {size} bytes exceeds max_frame_bytes={limit}")]
    FrameTooLarge { size: u64, limit: usize },
    #[error("body read failed: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TruncatedBody { .. } | Self::TruncatedChunkedBody { .. } => "truncated_body",
            Self::MalformedChunk(_) => "malformed_chunk",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Io(_) => "io",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Fixed { remaining: u64 },
    ChunkHeader,
    UntilClose,
    Done,
}

/// Pulls body frames off a connection according to a [`BodyFraming`].
#[derive(Debug)]
pub struct FrameReader {
    state: ReaderState,
    max_frame_bytes: usize,
    payload_bytes: u64,
}

impl FrameReader {
    pub fn new(framing: BodyFraming, max_frame_bytes: usize) -> Self {
        let state = match framing {
            BodyFraming::None | BodyFraming::ContentLength(0) => ReaderState::Done,
            BodyFraming::ContentLength(length) => ReaderState::Fixed { remaining: length },
            BodyFraming::Chunked => ReaderState::ChunkHeader,
            BodyFraming::CloseDelimited => ReaderState::UntilClose,
        };
        Self {
            state,
            max_frame_bytes: max_frame_bytes.max(1),
            payload_bytes: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReaderState::Done
    }

    /// Decoded body bytes returned so far.
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    /// Returns the next frame, or `None` once the body has ended.
    pub async fn next_frame<S: AsyncRead + Unpin>(
        &mut self,
        conn: &mut BufferedConn<S>,
    ) -> Result<Option<Frame>, FramingError> {
        match self.state {
            ReaderState::Done => Ok(None),
            ReaderState::Fixed { remaining } => self.next_fixed_frame(conn, remaining).await,
            ReaderState::ChunkHeader => self.next_chunk(conn).await,
            ReaderState::UntilClose => match conn.read_some(IO_CHUNK_SIZE).await? {
                Some(bytes) => {
                    self.payload_bytes += bytes.len() as u64;
                    Ok(Some(Frame {
                        payload: bytes.clone(),
                        wire: bytes,
                        last: false,
                    }))
                }
                None => {
                    self.state = ReaderState::Done;
                    Ok(None)
                }
            },
        }
    }

    async fn next_fixed_frame<S: AsyncRead + Unpin>(
        &mut self,
        conn: &mut BufferedConn<S>,
        remaining: u64,
    ) -> Result<Option<Frame>, FramingError> {
        let want = remaining.min(IO_CHUNK_SIZE as u64) as usize;
        let Some(bytes) = conn.read_some(want).await? else {
            return Err(FramingError::TruncatedBody {
                received: self.payload_bytes,
                missing: remaining,
            });
        };
        let remaining = remaining - bytes.len() as u64;
        self.payload_bytes += bytes.len() as u64;
        let last = remaining == 0;
        self.state = if last {
            ReaderState::Done
        } else {
            ReaderState::Fixed { remaining }
        };
        Ok(Some(Frame {
            payload: bytes.clone(),
            wire: bytes,
            last,
        }))
    }

    async fn next_chunk<S: AsyncRead + Unpin>(
        &mut self,
        conn: &mut BufferedConn<S>,
    ) -> Result<Option<Frame>, FramingError> {
        let line = self.read_chunked_line(conn, CHUNK_LINE_LIMIT).await?;
        let chunk_len = parse_chunk_len(&line)?;

        if chunk_len == 0 {
            let mut wire = BytesMut::from(&line[..]);
            let mut trailer_bytes = 0_usize;
            loop {
                let trailer = self.read_chunked_line(conn, CHUNK_LINE_LIMIT).await?;
                trailer_bytes += trailer.len();
                if trailer_bytes > TRAILER_LIMIT {
                    return Err(FramingError::MalformedChunk("trailer section too large"));
                }
                wire.extend_from_slice(&trailer);
                if &trailer[..] == b"\r\n" {
                    break;
                }
            }
            self.state = ReaderState::Done;
            return Ok(Some(Frame {
                payload: Bytes::new(),
                wire: wire.freeze(),
                last: true,
            }));
        }

        if chunk_len > self.max_frame_bytes as u64 {
            return Err(FramingError::FrameTooLarge {
                size: chunk_len,
                limit: self.max_frame_bytes,
            });
        }

        let data_len = chunk_len as usize;
        let body = match conn.read_exact_bytes(data_len + 2).await {
            Ok(body) => body,
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FramingError::TruncatedChunkedBody {
                    received: self.payload_bytes,
                });
            }
            Err(error) => return Err(error.into()),
        };
        if &body[data_len..] != b"\r\n" {
            return Err(FramingError::MalformedChunk("missing CRLF after chunk data"));
        }

        let mut wire = BytesMut::with_capacity(line.len() + body.len());
        wire.extend_from_slice(&line);
        wire.extend_from_slice(&body);
        self.payload_bytes += chunk_len;
        Ok(Some(Frame {
            payload: body.slice(..data_len),
            wire: wire.freeze(),
            last: false,
        }))
    }

    async fn read_chunked_line<S: AsyncRead + Unpin>(
        &self,
        conn: &mut BufferedConn<S>,
        limit: usize,
    ) -> Result<Bytes, FramingError> {
        match conn.read_until_pattern(b"\r\n", limit).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(FramingError::TruncatedChunkedBody {
                received: self.payload_bytes,
            }),
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                Err(FramingError::TruncatedChunkedBody {
                    received: self.payload_bytes,
                })
            }
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                Err(FramingError::MalformedChunk("chunk line exceeded limit"))
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Parses a chunk-size line (CRLF included). Extensions after `;` are ignored.
pub fn parse_chunk_len(line: &[u8]) -> Result<u64, FramingError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| FramingError::MalformedChunk("chunk size line had invalid UTF-8"))?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    if size_text.is_empty() || !size_text.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(FramingError::MalformedChunk("chunk size was not hex"));
    }
    u64::from_str_radix(size_text, 16)
        .map_err(|_| FramingError::MalformedChunk("chunk size overflowed"))
}
