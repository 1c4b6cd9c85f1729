use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tap_http::StreamEvent;
use thiserror::Error;

use crate::{Direction, ExchangeContext, Observer};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("observer `{name}` is already registered")]
    Duplicate { name: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub errors: u64,
    pub panics: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    Failed,
    Panicked,
}

/// Ordered set of observers. Filled at startup, then frozen behind an `Arc`.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<Arc<dyn Observer>>,
    delivered: AtomicU64,
    errors: AtomicU64,
    panics: AtomicU64,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field(
                "observers",
                &self.observers.iter().map(|o| o.name()).collect::<Vec<_>>(),
            )
            .field("stats", &self.stats())
            .finish()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an observer. The same `Arc` may not be registered twice.
    pub fn register(&mut self, observer: Arc<dyn Observer>) -> Result<(), RegistryError> {
        let candidate = Arc::as_ptr(&observer) as *const ();
        if self
            .observers
            .iter()
            .any(|existing| Arc::as_ptr(existing) as *const () == candidate)
        {
            return Err(RegistryError::Duplicate {
                name: observer.name().to_string(),
            });
        }
        self.observers.push(observer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn observers(&self) -> &[Arc<dyn Observer>] {
        &self.observers
    }

    /// Calls every observer in registration order on the current task.
    pub fn dispatch(
        &self,
        direction: Direction,
        exchange: &ExchangeContext,
        event: &StreamEvent,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for observer in &self.observers {
            match self.invoke(observer.as_ref(), direction, exchange, event) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Failed | Delivery::Panicked => report.failed += 1,
            }
        }
        report
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn invoke(
        &self,
        observer: &dyn Observer,
        direction: Direction,
        exchange: &ExchangeContext,
        event: &StreamEvent,
    ) -> Delivery {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            observer.on_event(direction, exchange, event)
        }));
        match outcome {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Delivered
            }
            Ok(Err(error)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    observer = observer.name(),
                    exchange_id = %exchange.id,
                    direction = direction.as_str(),
                    %error,
                    "observer failed to handle event"
                );
                Delivery::Failed
            }
            Err(_) => {
                self.panics.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    observer = observer.name(),
                    exchange_id = %exchange.id,
                    direction = direction.as_str(),
                    "observer panicked while handling event"
                );
                Delivery::Panicked
            }
        }
    }
}
