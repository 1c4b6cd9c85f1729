use std::env;
use std::sync::Arc;

use tap_observe::{LoggingObserver, ObserverRegistry};
use tap_proxy::{ProxyConfig, ProxyServer, ServerError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const ENV_CONFIG_PATH: &str = "SSE_TAP_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitClass {
    Ok,
    ConfigInvalid,
    ServerInitFailed,
    BindFailed,
    RuntimeFailed,
}

impl ExitClass {
    fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ConfigInvalid => 20,
            Self::ServerInitFailed => 21,
            Self::BindFailed => 22,
            Self::RuntimeFailed => 23,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ConfigInvalid => "config_invalid",
            Self::ServerInitFailed => "server_init_failed",
            Self::BindFailed => "bind_failed",
            Self::RuntimeFailed => "runtime_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunOutcome {
    class: ExitClass,
    detail: Option<String>,
}

impl RunOutcome {
    fn ok(detail: impl Into<String>) -> Self {
        Self {
            class: ExitClass::Ok,
            detail: Some(detail.into()),
        }
    }

    fn error(class: ExitClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: Some(detail.into()),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let outcome = run().await;
    let detail = outcome.detail.as_deref().unwrap_or("");
    if outcome.class == ExitClass::Ok {
        tracing::info!(exit_class = outcome.class.label(), detail, "sse-tap exited");
    } else {
        tracing::error!(exit_class = outcome.class.label(), detail, "sse-tap exited");
    }
    std::process::exit(outcome.class.code());
}

async fn run() -> RunOutcome {
    let config = match load_config() {
        Ok(config) => config,
        Err(error) => return RunOutcome::error(ExitClass::ConfigInvalid, error.to_string()),
    };

    let mut registry = ObserverRegistry::new();
    if let Err(error) = registry.register(Arc::new(LoggingObserver::new())) {
        return RunOutcome::error(ExitClass::ServerInitFailed, error.to_string());
    }

    let server = match ProxyServer::new(config, registry) {
        Ok(server) => server,
        Err(ServerError::Config(error)) => {
            return RunOutcome::error(ExitClass::ConfigInvalid, error.to_string())
        }
        Err(error) => return RunOutcome::error(ExitClass::ServerInitFailed, error.to_string()),
    };
    let listener = match server.bind_listener().await {
        Ok(listener) => listener,
        Err(error) => return RunOutcome::error(ExitClass::BindFailed, error.to_string()),
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
        }
        shutdown.shutdown();
    });

    let metrics = server.metrics_handle();
    match server.run_with_listener(listener).await {
        Ok(()) => {
            let snapshot = metrics.snapshot();
            tracing::info!(
                sessions = snapshot.sessions_total,
                exchanges = snapshot.exchanges_completed,
                events = snapshot.events_decoded,
                dropped = snapshot.events_dropped,
                "final counters"
            );
            RunOutcome::ok("server exited cleanly")
        }
        Err(error) => RunOutcome::error(ExitClass::RuntimeFailed, error.to_string()),
    }
}

fn load_config() -> Result<ProxyConfig, tap_core::ConfigError> {
    let path = env::args()
        .nth(1)
        .or_else(|| env::var(ENV_CONFIG_PATH).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    match path {
        Some(path) => ProxyConfig::from_json_file(&path),
        None => {
            let config = ProxyConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
