use std::sync::{Arc, OnceLock};

use anyhow::Result;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use crate::config::ProxyConfig;
use crate::net::Listener;
use crate::plugin::PluginRegistry;
use crate::server::{self, ProxyState};

/// Keeps the non-blocking log writer alive; dropping it would flush and
/// stop the writer thread while the proxy is still logging.
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Proxy lifecycle: init logging → build state → bind → serve → shutdown.
pub async fn run(config: ProxyConfig) -> Result<()> {
    init_logging();

    // Phase 1: build shared state — loads CA material when interception is
    // configured; a failure here is fatal to the worker.
    let registry = PluginRegistry::builder()
        .enable_from_config(&config.plugins)?
        .build();
    let state = ProxyState::new(config, registry)?;
    if state.interceptor.is_some() {
        tracing::info!("server: TLS interception enabled");
    } else {
        tracing::info!("server: TLS interception disabled, CONNECT tunnels opaquely");
    }

    // Phase 2: bind the listening endpoint.
    let listener = Listener::bind(&state.config).await?;
    if let Some(addr) = listener.local_addr() {
        tracing::info!("server: starting proxy, listen={}", addr);
    }

    // Phase 3: serve until a stop signal arrives.
    let shutdown = Arc::new(Notify::new());
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(listener, state, shutdown).await }
    });

    let signal = stop_signal().await;
    tracing::info!("server: {} caught, stopping accept loop", signal);
    shutdown.notify_waiters();

    // Wait for the accept loop to finish draining in-flight works.
    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy error: {}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_logging() {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();

    let _ = LOG_GUARD.set(guard);
}

/// Resolves when the process is told to stop, naming the trigger. SIGTERM
/// only exists on unix; elsewhere ctrl-c is the sole trigger.
async fn stop_signal() -> &'static str {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}
