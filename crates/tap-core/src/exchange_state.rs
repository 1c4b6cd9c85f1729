#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    AwaitingRequest,
    RequestReceived,
    AwaitingResponse,
    ResponseHeaders,
    StreamingBody,
    Complete,
    Failed,
}

impl ExchangeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingRequest => "awaiting_request",
            Self::RequestReceived => "request_received",
            Self::AwaitingResponse => "awaiting_response",
            Self::ResponseHeaders => "response_headers",
            Self::StreamingBody => "streaming_body",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeSignal {
    RequestHead,
    RequestForwarded,
    InterimResponse,
    ResponseHead,
    BodyStarted,
    BodiesFinished,
    Failure,
    NextRequest,
}

/// Legal transitions of one request/response exchange. `None` means the
/// signal is not valid in `current`.
pub fn next_exchange_state(
    current: ExchangeState,
    signal: ExchangeSignal,
) -> Option<ExchangeState> {
    match signal {
        ExchangeSignal::RequestHead => (current == ExchangeState::AwaitingRequest)
            .then_some(ExchangeState::RequestReceived),
        ExchangeSignal::RequestForwarded => (current == ExchangeState::RequestReceived)
            .then_some(ExchangeState::AwaitingResponse),
        ExchangeSignal::InterimResponse => (current == ExchangeState::AwaitingResponse)
            .then_some(ExchangeState::AwaitingResponse),
        ExchangeSignal::ResponseHead => (current == ExchangeState::AwaitingResponse)
            .then_some(ExchangeState::ResponseHeaders),
        ExchangeSignal::BodyStarted => (current == ExchangeState::ResponseHeaders)
            .then_some(ExchangeState::StreamingBody),
        ExchangeSignal::BodiesFinished => matches!(
            current,
            ExchangeState::ResponseHeaders | ExchangeState::StreamingBody
        )
        .then_some(ExchangeState::Complete),
        ExchangeSignal::Failure => (!current.is_terminal()).then_some(ExchangeState::Failed),
        ExchangeSignal::NextRequest => {
            (current == ExchangeState::Complete).then_some(ExchangeState::AwaitingRequest)
        }
    }
}

/// Current state of the exchange running on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeLifecycle {
    state: ExchangeState,
}

impl Default for ExchangeLifecycle {
    fn default() -> Self {
        Self {
            state: ExchangeState::AwaitingRequest,
        }
    }
}

impl ExchangeLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Applies `signal`, leaving the state untouched when the transition is
    /// illegal.
    pub fn advance(&mut self, signal: ExchangeSignal) -> Result<ExchangeState, ExchangeState> {
        match next_exchange_state(self.state, signal) {
            Some(next) => {
                self.state = next;
                Ok(next)
            }
            None => {
                debug_assert!(
                    false,
                    "illegal exchange transition: state={:?}, signal={signal:?}",
                    self.state
                );
                Err(self.state)
            }
        }
    }
}
