use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Returns a token that is cancelled on Ctrl+C.
///
/// Clones share the cancellation, so the scheduler and background tasks can
/// all watch the same token.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cloned_token = token.clone();

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 Received Ctrl+C. Initiating graceful shutdown...");
                cloned_token.cancel();
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });

    token
}
