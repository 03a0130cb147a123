pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::ProxyState;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::net::Listener;
use crate::proxy::HttpProtocolHandler;

/// Run the accept loop with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight works to complete before
/// returning.
pub async fn run_proxy_server(
    listener: Listener,
    state: ProxyState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    // In-flight works, for shutdown draining (metrics gauges are
    // write-only).
    let active_works = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "proxy_connections_total",
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: accept failed, error={}", e);
                metrics::counter!(
                    "proxy_connections_total",
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("proxy_connections_active").increment(1.0);
        active_works.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active = active_works.clone();
        tokio::spawn(async move {
            HttpProtocolHandler::new(state, stream, peer).run().await;
            metrics::gauge!("proxy_connections_active").decrement(1.0);
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain: poll the in-flight count until empty or the deadline passes.
    let deadline = std::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        let remaining = active_works.load(Ordering::Relaxed);
        if remaining <= 0 {
            info!("server: drained, all works finished");
            break;
        }
        if std::time::Instant::now() >= deadline {
            info!("server: drain timeout, dropping {} in-flight works", remaining);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    Ok(())
}
