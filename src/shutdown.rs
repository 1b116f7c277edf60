//! Graceful shutdown coordination using cancellation tokens.
//!
//! The first interrupt flips a cooperative flag that chat loops poll at batch
//! boundaries only; in-flight transfers always run to completion so no partial
//! file or half-spent batch is left behind. A second interrupt while already
//! draining asks the process to exit at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What the signal handler should do after an interrupt was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: drain the current batch, commit, stop.
    Drain,
    /// Repeated signal: terminate without a final commit.
    Terminate,
}

/// Controller for coordinating graceful shutdown across tasks.
#[derive(Clone)]
pub struct ShutdownController {
    token: CancellationToken,
    signals: Arc<AtomicUsize>,
}

impl ShutdownController {
    /// Create a new shutdown controller.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            signals: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Trigger shutdown, notifying all waiting tasks.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Record an external interrupt and decide how to react to it.
    pub fn on_signal(&self) -> SignalAction {
        let previous = self.signals.fetch_add(1, Ordering::SeqCst);
        self.trigger();
        if previous == 0 {
            SignalAction::Drain
        } else {
            SignalAction::Terminate
        }
    }

    /// Check if shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Get a future that completes when shutdown is triggered.
    /// Use this in `tokio::select!` to check for shutdown.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}
