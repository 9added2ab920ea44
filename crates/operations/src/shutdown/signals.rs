//! Signal handling for graceful shutdown.

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that was received.
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::ctrl_c;
    ctrl_c().await.expect("failed to register Ctrl+C handler");
    "Ctrl+C"
}
