//! Shutdown signalling.
//!
//! ## Sources
//!
//! - SIGINT (Ctrl+C)
//! - SIGTERM (Unix only)
//! - Every producer reached its message limit
//! - Manual trigger through a [`ShutdownHandle`]
//!
//! ## Usage
//!
//! ```ignore
//! let handle = ShutdownHandle::new();
//!
//! // In a worker loop
//! let mut shutdown = handle.clone();
//! tokio::select! {
//!     _ = shutdown.wait() => break,
//!     _ = tokio::time::sleep(interval) => {}
//! }
//!
//! // Elsewhere
//! handle.shutdown();
//! ```

use std::fmt;
use tokio::sync::watch;
use tracing::error;

/// What started the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Received SIGINT (Ctrl+C)
    SigInt,
    /// Received SIGTERM
    SigTerm,
    /// All producers stopped on their own
    ProducersFinished,
    /// Manual shutdown requested
    Manual,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            Self::SigTerm => write!(f, "SIGTERM"),
            Self::ProducersFinished => write!(f, "producers finished"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Handle for triggering and observing shutdown.
///
/// Clones share the same state. The first signal wins; later triggers are
/// ignored.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: watch::Sender<Option<ShutdownSignal>>,
    receiver: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownHandle {
    /// Create a new, untriggered handle.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self { sender, receiver }
    }

    /// Trigger a manual shutdown.
    pub fn shutdown(&self) {
        self.trigger(ShutdownSignal::Manual);
    }

    /// Trigger shutdown with an explicit reason.
    ///
    /// Returns `false` if shutdown was already triggered.
    pub fn trigger(&self, signal: ShutdownSignal) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        })
    }

    /// Wait for the shutdown signal.
    pub async fn wait(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.receiver.borrow_and_update() {
                return signal;
            }
            if self.receiver.changed().await.is_err() {
                return ShutdownSignal::Manual;
            }
        }
    }

    /// Signal that started the shutdown, if any.
    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.receiver.borrow()
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        self.receiver.borrow().is_some()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes when SIGINT or SIGTERM is received.
///
/// If a handler cannot be installed the error is logged and that source never
/// fires.
pub async fn shutdown_signal() -> ShutdownSignal {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::SigInt,
            Err(e) => {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                ShutdownSignal::SigTerm
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}
