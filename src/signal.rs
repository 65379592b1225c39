//! Shutdown signal handling.

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::info;

/// SIGTERM, SIGINT and SIGQUIT listeners, installed up front so a failure
/// surfaces at startup instead of at shutdown.
pub struct ShutdownSignals {
    term: Signal,
    int: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Resolves when any of the signals arrives.
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.term.recv() => info!("received SIGTERM, shutting down"),
            _ = self.int.recv() => info!("received SIGINT, shutting down"),
            _ = self.quit.recv() => info!("received SIGQUIT, shutting down"),
        }
    }
}
