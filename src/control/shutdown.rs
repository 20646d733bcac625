use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Why a session is ending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No command line arrived within the rolling timeout
    InputTimeout,
    /// Command input reached end of stream or could not be read
    InputClosed,
    /// Ctrl-C / SIGINT
    Interrupted,
    SessionElapsed,
    /// A `shutdown` command
    Requested,
    /// The worker stopped on an error
    Failed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ShutdownReason::InputTimeout => "command input timed out",
            ShutdownReason::InputClosed => "command input closed",
            ShutdownReason::Interrupted => "interrupted",
            ShutdownReason::SessionElapsed => "session duration elapsed",
            ShutdownReason::Requested => "shutdown requested",
            ShutdownReason::Failed => "worker failed",
        };
        f.write_str(text)
    }
}

/// Shared shutdown flag
///
/// Set at most once; the first reason wins. Cloned into the reader, the
/// worker and the signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the flag. Returns false if it was already raised.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            tracing::info!(%reason, "🛑 shutdown triggered");
        }
        first
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    pub fn is_triggered(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the flag is raised
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives in self, so this cannot happen
                std::future::pending::<()>().await;
            }
        }
    }
}
