use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tap_core::{ConfigError, ProxyConfig, ProxyMetrics, ProxyMetricsStore};
use tap_observe::ObserverRegistry;
use tap_tls::{build_http1_client_config, CertificateProvider, MitmCertificateStore, TlsConfigError};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::exchange::write_proxy_response;
use crate::session::{run_session, SessionRuntime};
use crate::upstream::UpstreamConnector;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("certificate authority setup failed: {0}")]
    Tls(#[from] TlsConfigError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Triggers a graceful stop of a running [`ProxyServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }
}

/// Read-only view of the server counters that outlives `run`.
#[derive(Clone)]
pub struct MetricsHandle {
    metrics: Arc<ProxyMetricsStore>,
    registry: Arc<ObserverRegistry>,
}

impl MetricsHandle {
    pub fn snapshot(&self) -> ProxyMetrics {
        let stats = self.registry.stats();
        self.metrics.set_observer_failures(stats.errors, stats.panics);
        self.metrics.snapshot()
    }
}

pub struct ProxyServer {
    runtime: Arc<SessionRuntime>,
    shutdown: Arc<watch::Sender<bool>>,
    next_session_id: AtomicU64,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, registry: ObserverRegistry) -> Result<Self, ServerError> {
        config.validate()?;
        let store = MitmCertificateStore::new(config.certificate_authority())?;
        Ok(Self::with_certificate_provider(
            config,
            registry,
            Arc::new(store),
        ))
    }

    /// Builds a server that issues leaf certificates from `certificates`.
    pub fn with_certificate_provider(
        config: ProxyConfig,
        registry: ObserverRegistry,
        certificates: Arc<dyn CertificateProvider>,
    ) -> Self {
        let connector = UpstreamConnector {
            tls_config: build_http1_client_config(config.upstream_tls_insecure_skip_verify),
            connect_timeout: config.upstream_connect_timeout(),
            idle_timeout: config.idle_timeout(),
        };
        let (shutdown, _) = watch::channel(false);
        Self {
            runtime: Arc::new(SessionRuntime {
                config,
                metrics: Arc::new(ProxyMetricsStore::new()),
                registry: Arc::new(registry),
                certificates,
                connector,
            }),
            shutdown: Arc::new(shutdown),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: Arc::clone(&self.shutdown),
        }
    }

    pub fn metrics_handle(&self) -> MetricsHandle {
        MetricsHandle {
            metrics: Arc::clone(&self.runtime.metrics),
            registry: Arc::clone(&self.runtime.registry),
        }
    }

    pub async fn run(self) -> Result<(), ServerError> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await?;
        Ok(())
    }

    pub async fn bind_listener(&self) -> Result<TcpListener, ServerError> {
        let address = self.runtime.config.listen_address.clone();
        TcpListener::bind(&address)
            .await
            .map_err(|source| ServerError::Bind { address, source })
    }

    /// Accepts sessions until the shutdown handle fires, then waits out the grace period.
    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        let config = &self.runtime.config;
        let permits = Arc::new(Semaphore::new(config.max_concurrent_sessions));
        let mut shutdown = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();
        tracing::info!(
            address = %listener.local_addr()?,
            tls_intercept = config.tls_intercept_enabled,
            observers = self.runtime.registry.len(),
            "proxy listening"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, client_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            match accept_error_backoff(&error) {
                                Some(backoff) => {
                                    tracing::warn!(
                                        %error,
                                        backoff_ms = backoff.as_millis() as u64,
                                        "accept failed"
                                    );
                                    tokio::time::sleep(backoff).await;
                                }
                                None => tracing::debug!(%error, "connection dropped before accept"),
                            }
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        self.runtime.metrics.mark_session_rejected();
                        sessions.spawn(reject_busy(stream, client_addr));
                        continue;
                    };
                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    let runtime = Arc::clone(&self.runtime);
                    let shutdown_rx = self.shutdown.subscribe();
                    sessions.spawn(async move {
                        run_session(runtime, stream, client_addr, session_id, shutdown_rx).await;
                        drop(permit);
                    });
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(error) = joined {
                        if error.is_panic() {
                            tracing::error!(%error, "session task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        let grace = config.shutdown_grace();
        tracing::info!(
            open_sessions = sessions.len(),
            grace_ms = grace.as_millis() as u64,
            "proxy shutting down"
        );
        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(aborted = sessions.len(), "sessions outlived the shutdown grace");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
        Ok(())
    }
}

/// Errors that concern only the connection being accepted are retried at
/// once. Anything else, such as running out of file descriptors, persists
/// across calls and gets a pause before the next attempt.
fn accept_error_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_ERROR_BACKOFF),
    }
}

async fn reject_busy(mut stream: TcpStream, client_addr: SocketAddr) {
    tracing::warn!(client = %client_addr, "session limit reached");
    if let Err(error) =
        write_proxy_response(&mut stream, "503 Service Unavailable", "proxy busy", true).await
    {
        tracing::debug!(client = %client_addr, %error, "busy response not delivered");
    }
}
