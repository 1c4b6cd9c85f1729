use thiserror::Error;

use crate::framing::BodyFraming;

pub const EVENT_STREAM_MEDIA_TYPE: &str = "text/event-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// A header as it appeared on the wire: name case is preserved, lookups
/// are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub raw: Vec<u8>,
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<HttpHeader>,
    pub framing: BodyFraming,
    pub connection_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub raw: Vec<u8>,
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<HttpHeader>,
    pub framing: BodyFraming,
    pub connection_close: bool,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum HeadParseError {
    #[error("message head was not valid UTF-8")]
    InvalidUtf8,
    #[error("request line is malformed")]
    MalformedRequestLine,
    #[error("status line is malformed")]
    MalformedStatusLine,
    #[error("only HTTP/1.0 and HTTP/1.1 are supported")]
    UnsupportedVersion,
    #[error("invalid response status code")]
    InvalidStatusCode,
    #[error("folded header lines are not supported")]
    FoldedHeader,
    #[error("malformed header line")]
    MalformedHeader,
    #[error("invalid header name")]
    InvalidHeaderName,
    #[error("invalid header value")]
    InvalidHeaderValue,
    #[error("invalid Content-Length value")]
    InvalidContentLength,
    #[error("conflicting Content-Length values")]
    ConflictingContentLength,
    #[error("conflicting Transfer-Encoding and Content-Length")]
    ConflictingFraming,
    #[error("unsupported Transfer-Encoding value")]
    UnsupportedTransferEncoding,
}

impl HeadParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MalformedRequestLine => "malformed_request_line",
            Self::MalformedStatusLine => "malformed_status_line",
            Self::UnsupportedVersion => "unsupported_version",
            Self::InvalidStatusCode => "invalid_status_code",
            Self::FoldedHeader => "folded_header",
            Self::MalformedHeader => "malformed_header",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::InvalidContentLength => "invalid_content_length",
            Self::ConflictingContentLength => "conflicting_content_length",
            Self::ConflictingFraming => "conflicting_framing",
            Self::UnsupportedTransferEncoding => "unsupported_transfer_encoding",
        }
    }
}

pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead, HeadParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadParseError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(HeadParseError::MalformedRequestLine)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HeadParseError::MalformedRequestLine)?;
    let target = parts.next().ok_or(HeadParseError::MalformedRequestLine)?;
    let version_text = parts.next().ok_or(HeadParseError::MalformedRequestLine)?;
    if parts.next().is_some() {
        return Err(HeadParseError::MalformedRequestLine);
    }
    let version = parse_http_version(version_text)?;

    let headers = parse_headers(lines)?;
    let framing = request_body_framing(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(RequestHead {
        raw: raw.to_vec(),
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        framing,
        connection_close,
    })
}

pub fn parse_response_head(
    raw: &[u8],
    request_method: &str,
) -> Result<ResponseHead, HeadParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| HeadParseError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or(HeadParseError::MalformedStatusLine)?;
    let mut parts = status_line.splitn(3, ' ');
    let version_text = parts.next().ok_or(HeadParseError::MalformedStatusLine)?;
    let status_text = parts.next().ok_or(HeadParseError::MalformedStatusLine)?;
    let reason_phrase = parts.next().unwrap_or("").trim().to_string();
    let version = parse_http_version(version_text)?;
    if status_text.len() != 3 {
        return Err(HeadParseError::InvalidStatusCode);
    }
    let status_code = status_text
        .parse::<u16>()
        .map_err(|_| HeadParseError::InvalidStatusCode)?;

    let headers = parse_headers(lines)?;
    let framing = response_body_framing(&headers, request_method, status_code)?;
    let connection_close =
        is_connection_close(version, &headers) || framing == BodyFraming::CloseDelimited;

    Ok(ResponseHead {
        raw: raw.to_vec(),
        version,
        status_code,
        reason_phrase,
        headers,
        framing,
        connection_close,
    })
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn is_event_stream(&self) -> bool {
        is_event_stream(&self.headers)
    }

    /// Serialises the head for the upstream hop: the target is replaced and
    /// proxy-only fields are dropped, every other header keeps its order and
    /// spelling.
    pub fn encode_for_upstream(&self, target: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        for header in &self.headers {
            if is_proxy_hop_header(&header.name) {
                continue;
            }
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn is_event_stream(&self) -> bool {
        is_event_stream(&self.headers)
    }

    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status_code) && self.status_code != 101
    }
}

fn is_proxy_hop_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("proxy-connection") || name.eq_ignore_ascii_case("proxy-authorization")
}

pub fn header_value<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

pub fn has_header_token(headers: &[HttpHeader], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case(name))
        .flat_map(|header| header.value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

/// True when `Content-Type` names the push-stream media type, ignoring
/// parameters and case.
pub fn is_event_stream(headers: &[HttpHeader]) -> bool {
    header_value(headers, "content-type")
        .and_then(|value| value.split(';').next())
        .map(|media_type| media_type.trim().eq_ignore_ascii_case(EVENT_STREAM_MEDIA_TYPE))
        .unwrap_or(false)
}

pub fn is_connection_close(version: HttpVersion, headers: &[HttpHeader]) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    version == HttpVersion::Http10 && !has_header_token(headers, "connection", "keep-alive")
}

fn parse_http_version(text: &str) -> Result<HttpVersion, HeadParseError> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(HeadParseError::UnsupportedVersion),
    }
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<HttpHeader>, HeadParseError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(HeadParseError::FoldedHeader);
        }
        let (name, value) = line.split_once(':').ok_or(HeadParseError::MalformedHeader)?;
        if name.is_empty() || !name.bytes().all(is_http_token_char) {
            return Err(HeadParseError::InvalidHeaderName);
        }
        let value = value.trim();
        if value
            .bytes()
            .any(|byte| matches!(byte, 0x00..=0x08 | 0x0A..=0x1F | 0x7F))
        {
            return Err(HeadParseError::InvalidHeaderValue);
        }
        headers.push(HttpHeader {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(headers)
}

fn is_http_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

fn request_body_framing(headers: &[HttpHeader]) -> Result<BodyFraming, HeadParseError> {
    let transfer_encoding = parse_transfer_encoding(headers)?;
    let content_length = parse_content_length(headers)?;
    match (transfer_encoding, content_length) {
        (TransferCoding::Absent, None) => Ok(BodyFraming::None),
        (TransferCoding::Absent, Some(0)) => Ok(BodyFraming::None),
        (TransferCoding::Absent, Some(length)) => Ok(BodyFraming::ContentLength(length)),
        (_, Some(_)) => Err(HeadParseError::ConflictingFraming),
        (TransferCoding::Chunked, None) => Ok(BodyFraming::Chunked),
        (TransferCoding::Other, None) => Err(HeadParseError::UnsupportedTransferEncoding),
    }
}

fn response_body_framing(
    headers: &[HttpHeader],
    request_method: &str,
    status_code: u16,
) -> Result<BodyFraming, HeadParseError> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304
    {
        return Ok(BodyFraming::None);
    }

    let transfer_encoding = parse_transfer_encoding(headers)?;
    let content_length = parse_content_length(headers)?;
    match (transfer_encoding, content_length) {
        (TransferCoding::Absent, None) => Ok(BodyFraming::CloseDelimited),
        (TransferCoding::Absent, Some(0)) => Ok(BodyFraming::None),
        (TransferCoding::Absent, Some(length)) => Ok(BodyFraming::ContentLength(length)),
        (_, Some(_)) => Err(HeadParseError::ConflictingFraming),
        (TransferCoding::Chunked, None) => Ok(BodyFraming::Chunked),
        (TransferCoding::Other, None) => Ok(BodyFraming::CloseDelimited),
    }
}

fn parse_content_length(headers: &[HttpHeader]) -> Result<Option<u64>, HeadParseError> {
    let mut value = None;
    for header in headers {
        if !header.name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        for raw in header.value.split(',') {
            let trimmed = raw.trim();
            if trimmed.is_empty() || !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
                return Err(HeadParseError::InvalidContentLength);
            }
            let parsed = trimmed
                .parse::<u64>()
                .map_err(|_| HeadParseError::InvalidContentLength)?;
            match value {
                Some(existing) if existing != parsed => {
                    return Err(HeadParseError::ConflictingContentLength);
                }
                _ => value = Some(parsed),
            }
        }
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferCoding {
    Absent,
    Chunked,
    Other,
}

/// `chunked` must be the final coding and may appear once.
fn parse_transfer_encoding(headers: &[HttpHeader]) -> Result<TransferCoding, HeadParseError> {
    let mut codings = Vec::new();
    for header in headers {
        if !header.name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        for coding in header.value.split(',') {
            let token = coding.split(';').next().unwrap_or("").trim();
            if token.is_empty() {
                return Err(HeadParseError::UnsupportedTransferEncoding);
            }
            codings.push(token.to_ascii_lowercase());
        }
    }

    let Some(last) = codings.last() else {
        return Ok(TransferCoding::Absent);
    };
    let chunked_count = codings.iter().filter(|coding| *coding == "chunked").count();
    if chunked_count > 1 || (chunked_count == 1 && last != "chunked") {
        return Err(HeadParseError::UnsupportedTransferEncoding);
    }
    if last == "chunked" {
        Ok(TransferCoding::Chunked)
    } else {
        Ok(TransferCoding::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        parse_request_head, parse_response_head, HeadParseError, HttpHeader, HttpVersion,
    };
    use crate::framing::BodyFraming;

    #[test]
    fn request_head_preserves_header_order_and_case() {
        let raw = b"GET /stream HTTP/1.1\r\nHost: example.com\r\nX-Trace-ID: 7\r\naccept: text/event-stream\r\n\r\n";
        let head = parse_request_head(raw).expect("parse");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/stream");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(
            head.headers,
            vec![
                HttpHeader {
                    name: "Host".to_string(),
                    value: "example.com".to_string()
                },
                HttpHeader {
                    name: "X-Trace-ID".to_string(),
                    value: "7".to_string()
                },
                HttpHeader {
                    name: "accept".to_string(),
                    value: "text/event-stream".to_string()
                },
            ]
        );
        assert_eq!(head.header("x-trace-id"), Some("7"));
        assert_eq!(head.framing, BodyFraming::None);
        assert!(!head.connection_close);
    }

    #[test]
    fn http10_without_keep_alive_closes() {
        let head = parse_request_head(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n").expect("parse");
        assert!(head.connection_close);
        let head = parse_request_head(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .expect("parse");
        assert!(!head.connection_close);
    }

    #[test]
    fn request_with_both_framings_is_rejected() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 4\r\n\r\n";
        assert_eq!(
            parse_request_head(raw).expect_err("conflict"),
            HeadParseError::ConflictingFraming
        );
    }

    #[test]
    fn response_framing_follows_status_and_method() {
        let sse = parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Type: Text/Event-Stream; charset=utf-8\r\nTransfer-Encoding: chunked\r\n\r\n",
            "GET",
        )
        .expect("parse");
        assert!(sse.is_event_stream());
        assert_eq!(sse.framing, BodyFraming::Chunked);

        let no_content = parse_response_head(b"HTTP/1.1 204 No Content\r\n\r\n", "GET")
            .expect("parse");
        assert_eq!(no_content.framing, BodyFraming::None);

        let head = parse_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n", "HEAD")
            .expect("parse");
        assert_eq!(head.framing, BodyFraming::None);

        let until_close = parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n", "GET").expect("parse");
        assert_eq!(until_close.framing, BodyFraming::CloseDelimited);
        assert!(until_close.connection_close);
    }

    #[test]
    fn interim_responses_are_detected() {
        let head = parse_response_head(b"HTTP/1.1 100 Continue\r\n\r\n", "POST").expect("parse");
        assert!(head.is_interim());
        assert_eq!(head.reason_phrase, "Continue");
    }

    #[test]
    fn encode_for_upstream_rewrites_target_and_drops_proxy_fields() {
        let raw = b"GET http://example.com/stream?q=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: Basic Zm9v\r\nAccept: text/event-stream\r\n\r\n";
        let head = parse_request_head(raw).expect("parse");
        let encoded = head.encode_for_upstream("/stream?q=1");
        assert_eq!(
            String::from_utf8(encoded).expect("utf8"),
            "GET /stream?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: text/event-stream\r\n\r\n"
        );
    }

    #[test]
    fn rejects_non_chunked_final_coding_on_requests() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked, gzip\r\n\r\n";
        assert_eq!(
            parse_request_head(raw).expect_err("bad coding"),
            HeadParseError::UnsupportedTransferEncoding
        );
    }
}
