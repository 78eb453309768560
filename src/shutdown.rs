use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Returns a token that is cancelled when SIGINT or SIGTERM is received.
/// Every subsystem watches this token and drains at its next loop boundary.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signal::ctrl_c().await;
            tracing::info!("received interrupt, initiating graceful shutdown");
        }

        trigger.cancel();
    });

    token
}
