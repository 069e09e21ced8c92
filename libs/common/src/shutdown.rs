//! Shutdown signal handling shared by services

use tracing::{info, warn};

/// Resolve when the process is asked to stop.
///
/// Unix: Ctrl+C (SIGINT) or SIGTERM. Elsewhere: Ctrl+C only.
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("SIGTERM handler unavailable ({}), only Ctrl+C will stop the service", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl+C received"),
            _ = async {
                match term.as_mut() {
                    Some(sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received");
    }
}
