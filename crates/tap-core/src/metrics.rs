use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyMetrics {
    pub sessions_total: u64,
    pub sessions_active: u64,
    pub sessions_active_watermark: u64,
    pub sessions_rejected: u64,
    pub session_duration_max_ms: u64,
    pub exchanges_completed: u64,
    pub exchanges_failed: u64,
    pub events_decoded: u64,
    pub framing_errors: u64,
    pub upstream_connect_errors: u64,
    pub tls_handshake_failures: u64,
    pub tunnels_passthrough: u64,
    pub observer_errors: u64,
    pub observer_panics: u64,
    pub events_dropped: u64,
}

/// Lock-free counters shared by every session of one server.
#[derive(Debug, Default)]
pub struct ProxyMetricsStore {
    sessions_total: AtomicU64,
    sessions_active: AtomicU64,
    sessions_active_watermark: AtomicU64,
    sessions_rejected: AtomicU64,
    session_duration_max_ms: AtomicU64,
    exchanges_completed: AtomicU64,
    exchanges_failed: AtomicU64,
    events_decoded: AtomicU64,
    framing_errors: AtomicU64,
    upstream_connect_errors: AtomicU64,
    tls_handshake_failures: AtomicU64,
    tunnels_passthrough: AtomicU64,
    observer_errors: AtomicU64,
    observer_panics: AtomicU64,
    events_dropped: AtomicU64,
}

impl ProxyMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a new session as active until the returned guard drops.
    pub fn begin_session(self: &Arc<Self>) -> SessionMetricsGuard {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        let active = self.sessions_active.fetch_add(1, Ordering::SeqCst) + 1;
        update_max_u64(&self.sessions_active_watermark, active);
        SessionMetricsGuard {
            store: Arc::clone(self),
            started_at: Instant::now(),
        }
    }

    pub fn mark_session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_exchange_completed(&self) {
        self.exchanges_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_exchange_failed(&self) {
        self.exchanges_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events_decoded(&self, count: u64) {
        self.events_decoded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn mark_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_upstream_connect_error(&self) {
        self.upstream_connect_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_tls_handshake_failure(&self) {
        self.tls_handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_passthrough_tunnel(&self) {
        self.tunnels_passthrough.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Observer failures are counted by the registry; the server copies its
    /// totals in here before taking a snapshot.
    pub fn set_observer_failures(&self, errors: u64, panics: u64) {
        self.observer_errors.store(errors, Ordering::Relaxed);
        self.observer_panics.store(panics, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyMetrics {
        ProxyMetrics {
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_active_watermark: self.sessions_active_watermark.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            session_duration_max_ms: self.session_duration_max_ms.load(Ordering::Relaxed),
            exchanges_completed: self.exchanges_completed.load(Ordering::Relaxed),
            exchanges_failed: self.exchanges_failed.load(Ordering::Relaxed),
            events_decoded: self.events_decoded.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            upstream_connect_errors: self.upstream_connect_errors.load(Ordering::Relaxed),
            tls_handshake_failures: self.tls_handshake_failures.load(Ordering::Relaxed),
            tunnels_passthrough: self.tunnels_passthrough.load(Ordering::Relaxed),
            observer_errors: self.observer_errors.load(Ordering::Relaxed),
            observer_panics: self.observer_panics.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct SessionMetricsGuard {
    store: Arc<ProxyMetricsStore>,
    started_at: Instant,
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        self.store.sessions_active.fetch_sub(1, Ordering::SeqCst);
        let duration_ms = self
            .started_at
            .elapsed()
            .as_millis()
            .min(u128::from(u64::MAX)) as u64;
        update_max_u64(&self.store.session_duration_max_ms, duration_ms);
    }
}

fn update_max_u64(target: &AtomicU64, candidate: u64) {
    loop {
        let current = target.load(Ordering::Relaxed);
        if candidate <= current {
            return;
        }
        if target
            .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}
