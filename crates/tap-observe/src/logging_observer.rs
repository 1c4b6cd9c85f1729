use tap_http::StreamEvent;

use crate::{Direction, ExchangeContext, Observer, ObserverError};

/// Writes every decoded event to the `tracing` pipeline at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl LoggingObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Observer for LoggingObserver {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_event(
        &self,
        direction: Direction,
        exchange: &ExchangeContext,
        event: &StreamEvent,
    ) -> Result<(), ObserverError> {
        let event_type = event.event.as_deref().unwrap_or("message");
        let event_id = event.id.as_deref().unwrap_or("");
        match direction {
            Direction::Client => tracing::info!(
                direction = direction.as_str(),
                exchange_id = %exchange.id,
                host = %exchange.server_host,
                event_type,
                event_id,
                data = %event.data,
                "message from client --->"
            ),
            Direction::Server => tracing::info!(
                direction = direction.as_str(),
                exchange_id = %exchange.id,
                host = %exchange.server_host,
                event_type,
                event_id,
                data = %event.data,
                "message from server <---"
            ),
        }
        Ok(())
    }
}
