//! Termination signal handling.
//!
//! SIGTERM, SIGINT and SIGQUIT all request the same orderly shutdown.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

/// Registered termination signal streams.
pub struct TerminationSignals {
    sigterm: Signal,
    sigint: Signal,
    sigquit: Signal,
}

impl TerminationSignals {
    /// Registers the handlers. Must be called from within a Tokio runtime.
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Waits for the first termination signal and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigquit.recv() => "SIGQUIT",
        };
        info!(signal = name, "Received termination signal");
        name
    }
}
