use thiserror::Error;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
    pub data: String,
    pub data_line_count: usize,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SseDecodeError {
    #[error("event exceeded max_event_bytes={limit}")]
    EventTooLarge { limit: usize },
}

/// A failed [`SseParser::feed`]. `events` holds what the same call completed
/// before the failing line, so the output does not depend on chunk cuts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error}")]
pub struct SseFeedError {
    pub events: Vec<StreamEvent>,
    pub error: SseDecodeError,
}

/// Incremental `text/event-stream` decoder.
///
/// One parser per body; bytes may be fed in arbitrarily sized pieces and the
/// emitted sequence does not depend on where the pieces were cut.
#[derive(Debug, Default)]
pub struct SseParser {
    pending_line: Vec<u8>,
    data_lines: Vec<String>,
    data_bytes: usize,
    event: Option<String>,
    id: Option<String>,
    retry_ms: Option<u64>,
    has_fields: bool,
    seen_first_line: bool,
    max_event_bytes: Option<usize>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_event_bytes(max_event_bytes: usize) -> Self {
        Self {
            max_event_bytes: Some(max_event_bytes),
            ..Self::default()
        }
    }

    /// Consumes bytes and returns every event completed by them, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, SseFeedError> {
        let mut emitted = Vec::new();
        let mut rest = chunk;
        while let Some(newline) = rest.iter().position(|byte| *byte == b'\n') {
            self.pending_line.extend_from_slice(&rest[..newline]);
            if let Err(error) = self.check_budget() {
                return Err(SseFeedError {
                    events: emitted,
                    error,
                });
            }
            self.process_completed_line(&mut emitted);
            rest = &rest[newline + 1..];
        }
        self.pending_line.extend_from_slice(rest);
        match self.check_budget() {
            Ok(()) => Ok(emitted),
            Err(error) => Err(SseFeedError {
                events: emitted,
                error,
            }),
        }
    }

    /// Ends the stream. An unterminated tail never becomes an event; returns
    /// whether anything was thrown away.
    pub fn finish(&mut self) -> bool {
        let discarded = !self.pending_line.is_empty() || self.has_fields;
        self.reset();
        discarded
    }

    pub fn reset(&mut self) {
        let max_event_bytes = self.max_event_bytes;
        *self = Self {
            max_event_bytes,
            ..Self::default()
        };
    }

    fn check_budget(&self) -> Result<(), SseDecodeError> {
        match self.max_event_bytes {
            Some(limit) if self.pending_line.len() + self.data_bytes > limit => {
                Err(SseDecodeError::EventTooLarge { limit })
            }
            _ => Ok(()),
        }
    }

    fn process_completed_line(&mut self, emitted: &mut Vec<StreamEvent>) {
        let mut line = std::mem::take(&mut self.pending_line);
        if !self.seen_first_line {
            self.seen_first_line = true;
            if line.starts_with(UTF8_BOM) {
                line.drain(..UTF8_BOM.len());
            }
        }
        trim_trailing_carriage_return(&mut line);
        if line.is_empty() {
            if let Some(event) = self.dispatch_event() {
                emitted.push(event);
            }
            return;
        }
        self.apply_line(&line);
    }

    fn apply_line(&mut self, line: &[u8]) {
        if line.first() == Some(&b':') {
            return;
        }
        let (field_bytes, value_bytes) = parse_field_line(line);
        if field_bytes.is_empty() {
            return;
        }
        let field = String::from_utf8_lossy(field_bytes);
        let value = String::from_utf8_lossy(value_bytes).into_owned();
        match field.as_ref() {
            "data" => {
                self.data_bytes += value.len() + 1;
                self.data_lines.push(value);
                self.has_fields = true;
            }
            "event" => {
                self.event = Some(value);
                self.has_fields = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value);
                    self.has_fields = true;
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit()) {
                    if let Ok(retry_ms) = value.parse::<u64>() {
                        self.retry_ms = Some(retry_ms);
                        self.has_fields = true;
                    }
                }
            }
            _ => {}
        }
    }

    fn dispatch_event(&mut self) -> Option<StreamEvent> {
        if !self.has_fields {
            return None;
        }

        let data_line_count = self.data_lines.len();
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        self.data_bytes = 0;
        self.has_fields = false;

        Some(StreamEvent {
            event: self.event.take(),
            id: self.id.take(),
            retry_ms: self.retry_ms.take(),
            data,
            data_line_count,
        })
    }
}

fn trim_trailing_carriage_return(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

fn parse_field_line(line: &[u8]) -> (&[u8], &[u8]) {
    if let Some(separator_index) = line.iter().position(|byte| *byte == b':') {
        let field = &line[..separator_index];
        let mut value = &line[separator_index + 1..];
        if value.first() == Some(&b' ') {
            value = &value[1..];
        }
        (field, value)
    } else {
        (line, &[])
    }
}
