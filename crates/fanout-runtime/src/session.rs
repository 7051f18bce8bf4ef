//! Per-request bookkeeping owned by the stream emitter.

use std::time::{Duration, Instant};

use fanout_protocol::{EventKind, FailureReason, RequestId, SeqNo, SourceId, StreamEvent};
use indexmap::IndexMap;
use serde::Serialize;

use crate::cancel::CancellationController;

/// Monotonic clock anchored at session start.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    started: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Pending,
    Running,
    Done,
}

#[derive(Debug, Clone)]
pub(crate) struct SourceProgress {
    pub(crate) state: SourceState,
    pub(crate) last_sequence: Option<SeqNo>,
    pub(crate) fragments: u64,
    pub(crate) outcome: Option<SourceOutcome>,
}

impl SourceProgress {
    fn new() -> Self {
        Self {
            state: SourceState::Pending,
            last_sequence: None,
            fragments: 0,
            outcome: None,
        }
    }

    pub(crate) fn next_sequence(&self) -> SeqNo {
        self.last_sequence.map_or(0, |last| last.saturating_add(1))
    }
}

/// Why an incoming event was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    UnknownSource,
    AfterTerminal,
    OutOfOrder { last: SeqNo },
    MissingStart,
}

/// The emitter-private view of one request.
#[derive(Debug)]
pub struct RequestSession {
    request_id: RequestId,
    per_source_state: IndexMap<SourceId, SourceProgress>,
    cancel: CancellationController,
    clock: SessionClock,
}

impl RequestSession {
    pub fn new(
        request_id: RequestId,
        sources: impl IntoIterator<Item = SourceId>,
        cancel: CancellationController,
    ) -> Self {
        let per_source_state = sources
            .into_iter()
            .map(|source_id| (source_id, SourceProgress::new()))
            .collect();
        Self {
            request_id,
            per_source_state,
            cancel,
            clock: SessionClock::start(),
        }
    }

    pub fn clock(&self) -> SessionClock {
        self.clock
    }

    pub fn source_count(&self) -> usize {
        self.per_source_state.len()
    }

    pub fn all_done(&self) -> bool {
        self.per_source_state
            .values()
            .all(|progress| progress.state == SourceState::Done)
    }

    pub fn unfinished(&self) -> Vec<SourceId> {
        self.per_source_state
            .iter()
            .filter(|(_, progress)| progress.state != SourceState::Done)
            .map(|(source_id, _)| source_id.clone())
            .collect()
    }

    pub(crate) fn progress(&self, source_id: &SourceId) -> Option<&SourceProgress> {
        self.per_source_state.get(source_id)
    }

    /// Validates `event` against the per-source invariant and, if it may be
    /// forwarded, records it.
    pub(crate) fn admit(&mut self, event: &StreamEvent) -> Result<(), Rejection> {
        let progress = self
            .per_source_state
            .get_mut(&event.source_id)
            .ok_or(Rejection::UnknownSource)?;

        if progress.state == SourceState::Done {
            return Err(Rejection::AfterTerminal);
        }
        if let Some(last) = progress.last_sequence
            && event.sequence <= last
        {
            return Err(Rejection::OutOfOrder { last });
        }
        match (&event.kind, progress.state) {
            (EventKind::Started, SourceState::Pending) => {}
            (EventKind::Started, _) => {
                return Err(Rejection::OutOfOrder {
                    last: progress.last_sequence.unwrap_or_default(),
                });
            }
            (_, SourceState::Pending) => return Err(Rejection::MissingStart),
            _ => {}
        }

        progress.last_sequence = Some(event.sequence);
        match &event.kind {
            EventKind::Started => progress.state = SourceState::Running,
            EventKind::Fragment { .. } => progress.fragments += 1,
            EventKind::Completed => {
                progress.state = SourceState::Done;
                progress.outcome = Some(SourceOutcome::completed(progress.fragments, event));
            }
            EventKind::Failed { reason, message } => {
                progress.state = SourceState::Done;
                progress.outcome = Some(SourceOutcome::failed(
                    progress.fragments,
                    event,
                    *reason,
                    message.clone(),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn into_report(self, events_forwarded: u64, events_dropped: u64) -> SessionReport {
        let elapsed = self.clock.elapsed();
        let outcomes = self
            .per_source_state
            .into_iter()
            .filter_map(|(source_id, progress)| progress.outcome.map(|outcome| (source_id, outcome)))
            .collect();
        SessionReport {
            request_id: self.request_id,
            outcomes,
            events_forwarded,
            events_dropped,
            elapsed_ms: duration_ms(elapsed),
            cancelled: self.cancel.is_cancelled(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub status: OutcomeStatus,
    pub fragments: u64,
    pub last_sequence: SeqNo,
    pub finished_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SourceOutcome {
    fn completed(fragments: u64, event: &StreamEvent) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            fragments,
            last_sequence: event.sequence,
            finished_at_ms: duration_ms(event.emitted_at),
            message: None,
        }
    }

    fn failed(fragments: u64, event: &StreamEvent, reason: FailureReason, message: String) -> Self {
        Self {
            status: OutcomeStatus::Failed(reason),
            fragments,
            last_sequence: event.sequence,
            finished_at_ms: duration_ms(event.emitted_at),
            message: Some(message),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self.status {
            OutcomeStatus::Completed => None,
            OutcomeStatus::Failed(reason) => Some(reason),
        }
    }
}

/// Summary handed back to the emitter's caller once the session finishes.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub request_id: RequestId,
    pub outcomes: IndexMap<SourceId, SourceOutcome>,
    pub events_forwarded: u64,
    pub events_dropped: u64,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

impl SessionReport {
    pub fn outcome(&self, source_id: &str) -> Option<&SourceOutcome> {
        self.outcomes.get(&SourceId::from(source_id))
    }

    pub fn completed_count(&self) -> usize {
        self.outcomes.values().filter(|outcome| outcome.is_completed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.completed_count()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
