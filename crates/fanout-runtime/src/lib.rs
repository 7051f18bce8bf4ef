//! Concurrency core of the fanout aggregator.
//!
//! One request fans out to several blocking source clients and fans their
//! fragments back in to a single ordered event stream:
//!
//! - [`pool`] bounds how many blocking invocations run at once.
//! - [`adapter`] turns one invocation into attributed, sequenced events.
//! - [`emitter`] is the single consumer that forwards events to the
//!   transport and decides when the session is finished.
//! - [`cancel`] is the shared cancellation signal.

use std::time::Duration;

pub mod adapter;
pub mod cancel;
pub mod emitter;
pub mod pool;
pub mod session;

pub use adapter::SourceAdapter;
pub use cancel::{CancelObserver, CancellationController};
pub use emitter::{EmitterState, SessionPlan, StreamEmitter};
pub use pool::{Acquired, WorkerPool, WorkerSlot};
pub use session::{
    OutcomeStatus, RequestSession, SessionClock, SessionReport, SourceOutcome, SourceState,
};

/// Default pool size, matching the default per-request source limit.
pub const DEFAULT_MAX_SOURCES: usize = 8;
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum number of source clients running at once (K).
    pub pool_size: usize,
    /// Per-source budget, measured from the moment the source is scheduled,
    /// so time spent queued for a pool slot counts against it.
    pub source_timeout: Duration,
    /// How long the emitter keeps draining after cancellation.
    pub cancel_grace: Duration,
    /// Shared channel capacity is `sources * channel_capacity_per_source`.
    pub channel_capacity_per_source: usize,
    /// Fragments buffered between a worker thread and its adapter.
    pub fragment_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_MAX_SOURCES,
            source_timeout: DEFAULT_SOURCE_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            channel_capacity_per_source: 4,
            fragment_buffer: 1,
        }
    }
}

impl RuntimeConfig {
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn source_timeout(mut self, source_timeout: Duration) -> Self {
        self.source_timeout = source_timeout;
        self
    }

    pub fn cancel_grace(mut self, cancel_grace: Duration) -> Self {
        self.cancel_grace = cancel_grace;
        self
    }

    pub fn channel_capacity_per_source(mut self, per_source: usize) -> Self {
        self.channel_capacity_per_source = per_source.max(1);
        self
    }

    pub fn fragment_buffer(mut self, fragment_buffer: usize) -> Self {
        self.fragment_buffer = fragment_buffer.max(1);
        self
    }

    pub fn channel_capacity(&self, source_count: usize) -> usize {
        source_count
            .saturating_mul(self.channel_capacity_per_source)
            .max(1)
    }
}
