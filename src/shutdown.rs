use std::sync::Arc;
use std::time::Duration;

use tokio::signal;

use crate::server::AppState;

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Perform graceful shutdown: cancel every in-flight run and give the
/// machines a moment to park their ledgers and snapshots.
pub async fn graceful_shutdown(state: &Arc<AppState>) {
    tracing::info!("Starting graceful shutdown...");

    let active = state.registry.active_ids().await;
    if active.is_empty() {
        tracing::info!("No in-flight runs to cancel");
        return;
    }

    tracing::info!(count = active.len(), "Cancelling in-flight runs");
    state.registry.cancel_all().await;

    let grace = Duration::from_secs(state.config.agents.cancel_grace_secs + 1);
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if state.registry.active_ids().await.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("Some runs did not stop within the grace period");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::info!("Graceful shutdown complete");
}
