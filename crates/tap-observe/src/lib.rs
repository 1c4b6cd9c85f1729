use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tap_http::StreamEvent;
use thiserror::Error;

mod logging_observer;
mod registry;
mod session_dispatcher;

pub use logging_observer::LoggingObserver;
pub use registry::{DispatchReport, DispatchStats, ObserverRegistry, RegistryError};
pub use session_dispatcher::{DrainReport, LaneStats, SessionDispatcher};

/// Which peer produced the stream an event was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Client,
    Server,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId {
    pub session_id: u64,
    pub sequence: u64,
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.session_id, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeContext {
    pub id: ExchangeId,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
    pub method: String,
    pub target: String,
    pub intercepted_tls: bool,
}

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("{0}")]
    Failed(String),
    #[error("observer I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ObserverError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Consumer of decoded stream events.
///
/// Implementations are shared across sessions and called from several tasks
/// at once, so they must be internally synchronised or stateless.
pub trait Observer: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(
        &self,
        direction: Direction,
        exchange: &ExchangeContext,
        event: &StreamEvent,
    ) -> Result<(), ObserverError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub direction: Direction,
    pub exchange_id: ExchangeId,
    pub event: StreamEvent,
}

/// Observer that keeps every event in memory.
#[derive(Debug, Clone)]
pub struct VecObserver {
    name: String,
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl VecObserver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn snapshot(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn data(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .map(|recorded| recorded.event.data)
            .collect()
    }
}

impl Default for VecObserver {
    fn default() -> Self {
        Self::new("vec")
    }
}

impl Observer for VecObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(
        &self,
        direction: Direction,
        exchange: &ExchangeContext,
        event: &StreamEvent,
    ) -> Result<(), ObserverError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                direction,
                exchange_id: exchange.id,
                event: event.clone(),
            });
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_context(session_id: u64) -> ExchangeContext {
    ExchangeContext {
        id: ExchangeId {
            session_id,
            sequence: 1,
        },
        client_addr: "127.0.0.1:50000".to_string(),
        server_host: "example.com".to_string(),
        server_port: 443,
        method: "GET".to_string(),
        target: "/stream".to_string(),
        intercepted_tls: true,
    }
}

#[cfg(test)]
pub(crate) fn test_event(data: &str) -> StreamEvent {
    StreamEvent {
        event: None,
        id: None,
        retry_ms: None,
        data: data.to_string(),
        data_line_count: 1,
    }
}
