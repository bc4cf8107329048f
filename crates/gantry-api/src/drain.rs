//! Process-wide drain signal.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `drain` on the first SIGINT or SIGTERM.
///
/// The token is never reset; a second signal has no further effect.
pub fn spawn_signal_handler(drain: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining");
        drain.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
