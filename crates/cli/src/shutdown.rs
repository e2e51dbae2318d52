//! Process shutdown signal handling.

use tokio::signal;
use tracing::{info, warn};

/// Wait for SIGTERM or SIGINT shutdown signal
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to register SIGTERM handler: {e}"),
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C, shutting down");
}
