//! Process-level helpers for agents running as their own process

use std::io;

use tokio_util::sync::CancellationToken;

/// Point stdin, stdout and stderr at `/dev/null`
///
/// Called right after the status report so the launching process sees
/// end-of-file on the agent's output and stops waiting.
#[cfg(unix)]
pub fn detach_stdio() -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    tracing::debug!("Detached from parent's stdio");
    Ok(())
}

#[cfg(not(unix))]
pub fn detach_stdio() -> io::Result<()> {
    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM
///
/// Handlers are installed before this returns, so a signal that arrives
/// right after the status report still triggers an orderly shutdown.
pub fn shutdown_on_signals() -> io::Result<CancellationToken> {
    let cancel = CancellationToken::new();

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let mut interrupt =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = interrupt.recv() => {
                tracing::info!("Received SIGINT, shutting down tunnel");
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, shutting down tunnel");
            }
        }

        #[cfg(not(unix))]
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down tunnel");
        }

        cancel_clone.cancel();
    });

    Ok(cancel)
}
