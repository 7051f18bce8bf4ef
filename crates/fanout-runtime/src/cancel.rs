//! Session-wide cancellation.
//!
//! One atomic flag per session plus a `Notify` so async waiters wake
//! immediately. Blocking worker threads only ever read the flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Write side of the session cancellation signal. Held by the stream
/// emitter and by whoever may cancel the session from outside.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    state: Arc<CancelState>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Idempotent; returns `true` only for the call that
    /// actually flipped it.
    pub fn cancel(&self) -> bool {
        let first = !self.state.cancelled.swap(true, Ordering::AcqRel);
        if first {
            debug!("session cancellation requested");
            self.state.notify.notify_waiters();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        wait_cancelled(&self.state).await;
    }

    /// Read-only view handed to adapters and worker threads.
    pub fn observer(&self) -> CancelObserver {
        CancelObserver {
            state: Arc::clone(&self.state),
        }
    }
}

/// Read side of the cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelObserver {
    state: Arc<CancelState>,
}

impl CancelObserver {
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        wait_cancelled(&self.state).await;
    }
}

async fn wait_cancelled(state: &CancelState) {
    loop {
        let notified = state.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel() cannot
        // slip between the check and the wait.
        notified.as_mut().enable();
        if state.cancelled.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}
