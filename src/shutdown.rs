use std::sync::Arc;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;

use crate::launcher::{FrameLauncher, ShutdownMode};

/// Drain `launcher` when the process is asked to stop.
///
/// SIGTERM and SIGINT are handled like `shutdown now`: running frames are
/// hard-killed and the launcher's shutdown token is cancelled. The task ends
/// once no frame is left running, whether the stop came from a signal or
/// from an explicit shutdown request.
pub fn drain_on_signal(launcher: Arc<FrameLauncher>) -> JoinHandle<()> {
    let stopped = launcher.shutdown_token();

    tokio::spawn(async move {
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => {
                if let Some(name) = wait_for_signal(sigterm, sigint, &stopped).await {
                    let running = launcher.shutdown(ShutdownMode::Now).await;
                    tracing::info!(signal = name, running, "Draining launcher");
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                stopped.cancelled().await;
            }
        }
        launcher.wait_idle().await;
    })
}

/// Name of the signal received, or None when shutdown was requested first.
async fn wait_for_signal(
    mut sigterm: Signal,
    mut sigint: Signal,
    stopped: &tokio_util::sync::CancellationToken,
) -> Option<&'static str> {
    tokio::select! {
        _ = sigterm.recv() => Some("SIGTERM"),
        _ = sigint.recv() => Some("SIGINT"),
        _ = stopped.cancelled() => None,
    }
}
