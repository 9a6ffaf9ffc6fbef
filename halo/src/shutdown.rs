//! Shutdown signal handling for the coordinator daemon.
//!
//! A signal only resolves the returned future and fans out over the
//! broadcast channel; tearing the cluster down is main's job.

use tokio::sync::broadcast;
use tracing::info;

#[cfg(unix)]
#[allow(clippy::expect_used)] // Signal handlers are startup-critical; abort is correct on failure
pub fn install_signal_handlers(
    shutdown_tx: broadcast::Sender<()>,
) -> impl std::future::Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

    async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(target: "halo::shutdown", "SIGTERM received, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!(target: "halo::shutdown", "SIGINT received, initiating graceful shutdown");
            }
        }

        let _ = shutdown_tx.send(());
    }
}

#[cfg(windows)]
pub async fn install_signal_handlers(shutdown_tx: broadcast::Sender<()>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "halo::shutdown", error = %e, "Failed to listen for Ctrl+C");
        return;
    }

    info!(target: "halo::shutdown", "Ctrl+C received, initiating graceful shutdown");
    let _ = shutdown_tx.send(());
}
