use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
/// Servers and worker loops monitor this token and drain gracefully.
#[cfg(unix)]
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    use tokio::signal::unix::{signal, SignalKind};

    let token = CancellationToken::new();
    let trigger = token.clone();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, initiating graceful shutdown");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}

/// Install a shutdown handler that listens for Ctrl-C and Ctrl-Break.
///
/// Both listeners are registered before returning, so a registration failure
/// is reported to the caller instead of cancelling the token.
#[cfg(windows)]
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    use tokio::signal::windows::{ctrl_break, ctrl_c};

    let token = CancellationToken::new();
    let trigger = token.clone();
    let mut interrupt = ctrl_c()?;
    let mut brk = ctrl_break()?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {
                tracing::info!("received Ctrl-C, initiating graceful shutdown");
            }
            _ = brk.recv() => {
                tracing::info!("received Ctrl-Break, initiating graceful shutdown");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
