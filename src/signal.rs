//! Shutdown signal handling: SIGINT/SIGTERM both cancel the shared token,
//! matching spec §5's "every task observes a per-task shutdown flag."

use tokio_util::sync::CancellationToken;

pub fn install(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "could not install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
            _ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
}
