use tracing::{error, info, warn};

/// Which signal ended the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Terminate,
    /// SIGINT / Ctrl-C
    Interrupt,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Resolve on the first SIGINT or SIGTERM.
///
/// If a handler cannot be installed the other one still counts; with neither
/// available this never resolves and the process must be killed.
#[cfg(unix)]
pub async fn wait_for_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            None
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!(error = %e, "Failed to register SIGINT handler");
            None
        }
    };

    let received = tokio::select! {
        Some(_) = recv_or_pending(sigterm.as_mut()) => ShutdownSignal::Terminate,
        Some(_) = recv_or_pending(sigint.as_mut()) => ShutdownSignal::Interrupt,
        else => {
            warn!("Signal streams closed; waiting indefinitely");
            std::future::pending::<ShutdownSignal>().await
        }
    };
    info!(signal = %received, "Received shutdown signal");
    received
}

#[cfg(unix)]
async fn recv_or_pending(signal: Option<&mut tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> ShutdownSignal {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
    ShutdownSignal::Interrupt
}
