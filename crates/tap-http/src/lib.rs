//! HTTP/1 wire handling for the tap proxy: buffered connection halves,
//! message head parsing, body framing and the `text/event-stream` decoder.

mod conn;
mod framing;
mod head;
mod sse_parser;

pub use conn::{
    idle_timeout_error, is_idle_timeout, is_peer_disconnect, BufferedConn, ConnWriter, Side,
    TlsState, IO_CHUNK_SIZE,
};
pub use framing::{
    parse_chunk_len, BodyFraming, Frame, FrameReader, FramingError, DEFAULT_MAX_FRAME_BYTES,
};
pub use head::{
    has_header_token, header_value, is_connection_close, is_event_stream, parse_request_head,
    parse_response_head, HeadParseError, HttpHeader, HttpVersion, RequestHead, ResponseHead,
    EVENT_STREAM_MEDIA_TYPE,
};
pub use sse_parser::{SseDecodeError, SseFeedError, SseParser, StreamEvent};
