use tokio::signal::unix::{signal, SignalKind};

/// Waits for SIGINT or SIGTERM and returns the name of the signal that
/// arrived. Registration errors surface before any waiting happens.
pub async fn shutdown_signal() -> anyhow::Result<&'static str> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}
