use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tap_http::StreamEvent;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::registry::ObserverRegistry;
use crate::{Direction, ExchangeContext, Observer};

#[derive(Debug)]
struct QueuedEvent {
    direction: Direction,
    exchange: Arc<ExchangeContext>,
    event: Arc<StreamEvent>,
}

#[derive(Debug, Default)]
struct LaneQueue {
    items: VecDeque<QueuedEvent>,
    closed: bool,
}

struct ObserverLane {
    observer: Arc<dyn Observer>,
    depth: usize,
    queue: Mutex<LaneQueue>,
    notify: Notify,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ObserverLane {
    fn lock(&self) -> MutexGuard<'_, LaneQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, item: QueuedEvent) {
        {
            let mut queue = self.lock();
            if queue.closed {
                return;
            }
            if queue.items.len() >= self.depth {
                queue.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.items.push_back(item);
        }
        self.notify.notify_one();
    }

    fn stats(&self) -> LaneStats {
        LaneStats {
            observer: self.observer.name().to_string(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.lock().items.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneStats {
    pub observer: String,
    pub delivered: u64,
    pub dropped: u64,
    pub pending: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub lanes: Vec<LaneStats>,
    pub timed_out: bool,
}

impl DrainReport {
    pub fn dropped(&self) -> u64 {
        self.lanes.iter().map(|lane| lane.dropped).sum()
    }
}

/// Per-session fan-out of decoded events.
///
/// Each observer gets its own bounded queue and worker task; `publish`
/// never waits on an observer and the observer itself runs on the blocking
/// pool. A full queue drops its oldest pending event.
/// With a depth of zero events are dispatched inline instead.
pub struct SessionDispatcher {
    registry: Arc<ObserverRegistry>,
    lanes: Vec<Arc<ObserverLane>>,
    workers: Vec<JoinHandle<()>>,
}

impl SessionDispatcher {
    pub fn new(registry: Arc<ObserverRegistry>, queue_depth: usize) -> Self {
        if queue_depth == 0 {
            return Self {
                registry,
                lanes: Vec::new(),
                workers: Vec::new(),
            };
        }

        let lanes = registry
            .observers()
            .iter()
            .map(|observer| {
                Arc::new(ObserverLane {
                    observer: Arc::clone(observer),
                    depth: queue_depth,
                    queue: Mutex::new(LaneQueue::default()),
                    notify: Notify::new(),
                    delivered: AtomicU64::new(0),
                    dropped: AtomicU64::new(0),
                })
            })
            .collect::<Vec<_>>();
        let workers = lanes
            .iter()
            .map(|lane| spawn_lane_worker(Arc::clone(&registry), Arc::clone(lane)))
            .collect();
        Self {
            registry,
            lanes,
            workers,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Hands a batch of events to every observer, preserving order.
    pub fn publish(
        &self,
        direction: Direction,
        exchange: &Arc<ExchangeContext>,
        events: Vec<StreamEvent>,
    ) {
        for event in events {
            if self.is_inline() {
                self.registry.dispatch(direction, exchange, &event);
                continue;
            }
            let event = Arc::new(event);
            for lane in &self.lanes {
                lane.push(QueuedEvent {
                    direction,
                    exchange: Arc::clone(exchange),
                    event: Arc::clone(&event),
                });
            }
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.lanes
            .iter()
            .map(|lane| lane.dropped.load(Ordering::Relaxed))
            .sum()
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        self.lanes.iter().map(|lane| lane.stats()).collect()
    }

    /// Stops accepting events and lets workers flush what is queued. Workers
    /// still busy after `grace` are aborted.
    pub async fn close_and_drain(mut self, grace: Duration) -> DrainReport {
        for lane in &self.lanes {
            lane.lock().closed = true;
            lane.notify.notify_one();
        }

        let mut workers = std::mem::take(&mut self.workers);
        let joined = tokio::time::timeout(grace, async {
            for worker in workers.iter_mut() {
                let _ = worker.await;
            }
        })
        .await;
        let timed_out = joined.is_err();
        if timed_out {
            for worker in &workers {
                worker.abort();
            }
        }

        DrainReport {
            lanes: self.lane_stats(),
            timed_out,
        }
    }
}

impl Drop for SessionDispatcher {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Observer calls are synchronous, so each delivery runs on the blocking pool
/// and a slow observer never holds a runtime worker thread.
fn spawn_lane_worker(registry: Arc<ObserverRegistry>, lane: Arc<ObserverLane>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = {
                let mut queue = lane.lock();
                match queue.items.pop_front() {
                    Some(item) => Some(item),
                    None if queue.closed => return,
                    None => None,
                }
            };
            let Some(item) = next else {
                lane.notify.notified().await;
                continue;
            };
            let registry = Arc::clone(&registry);
            let observer = Arc::clone(&lane.observer);
            let delivery = tokio::task::spawn_blocking(move || {
                registry.invoke(observer.as_ref(), item.direction, &item.exchange, &item.event);
            })
            .await;
            if let Err(error) = delivery {
                tracing::warn!(
                    observer = lane.observer.name(),
                    %error,
                    "observer delivery task failed"
                );
            }
            lane.delivered.fetch_add(1, Ordering::Relaxed);
        }
    })
}
