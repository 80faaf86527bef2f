use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The same token is cancelled when the controller deregisters the
/// node; the agent then finalizes in-flight runs and stops their containers.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, draining builds");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, draining builds");
            }
            _ = token_clone.cancelled() => return,
        }

        token_clone.cancel();
    });

    token
}

/// Cancel `token` once `input` ends, logging which input went away.
///
/// The agent cannot make progress without its channel subscription or the
/// runtime event stream, so losing either is treated as a shutdown request.
pub fn cancel_when_closed<F>(token: CancellationToken, input: &'static str, closed: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = closed => {
                tracing::error!(input, "Input stream ended, shutting down");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}
