//! The stream emitter: sole consumer of the shared event channel.
//!
//! State machine:
//!
//! ```text
//! Initializing -> Streaming -> Draining -> Finished
//!                     |                       ^
//!                     +------> Cancelling ----+
//! ```
//!
//! Source failures are forwarded like any other event. Only a transport
//! failure ends the session with an error.

use std::sync::Arc;

use fanout_events::{EventReceiver, event_channel};
use fanout_protocol::{
    AggregatorError, AggregatorResult, EventKind, EventSink, SourceClient, SourceId, SourceRequest,
    StreamEvent,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::RuntimeConfig;
use crate::adapter::SourceAdapter;
use crate::cancel::CancellationController;
use crate::pool::WorkerPool;
use crate::session::{RequestSession, SessionReport, SourceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    Initializing,
    Streaming,
    Cancelling,
    Draining,
    Finished,
}

/// What to run: the shared request and one client per requested source, in
/// request order. Source ids are expected to be unique.
#[derive(Clone)]
pub struct SessionPlan {
    pub request: Arc<SourceRequest>,
    pub sources: Vec<(SourceId, Arc<dyn SourceClient>)>,
}

impl SessionPlan {
    pub fn new(request: SourceRequest) -> Self {
        Self {
            request: Arc::new(request),
            sources: Vec::new(),
        }
    }

    pub fn source(mut self, source_id: impl Into<SourceId>, client: Arc<dyn SourceClient>) -> Self {
        self.sources.push((source_id.into(), client));
        self
    }
}

#[derive(Debug)]
pub struct StreamEmitter {
    config: RuntimeConfig,
    pool: Option<WorkerPool>,
    state: EmitterState,
    forwarded: u64,
    dropped: u64,
}

impl StreamEmitter {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            pool: None,
            state: EmitterState::Initializing,
            forwarded: 0,
            dropped: 0,
        }
    }

    /// Runs this session's invocations on a pool shared with other
    /// sessions instead of a fresh one sized from the config.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Drives one request session to completion, forwarding every event to
    /// `sink`. `cancel` may be triggered from outside at any time.
    #[instrument(
        skip_all,
        fields(request_id = %plan.request.request_id, sources = plan.sources.len())
    )]
    pub async fn run<S>(
        mut self,
        plan: SessionPlan,
        sink: &mut S,
        cancel: CancellationController,
    ) -> AggregatorResult<SessionReport>
    where
        S: EventSink + ?Sized,
    {
        let mut session = RequestSession::new(
            plan.request.request_id.clone(),
            plan.sources.iter().map(|(source_id, _)| source_id.clone()),
            cancel.clone(),
        );
        let (sender, mut receiver) = event_channel(self.config.channel_capacity(session.source_count()));
        let pool = self
            .pool
            .clone()
            .unwrap_or_else(|| WorkerPool::new(self.config.pool_size));

        let mut adapters = JoinSet::new();
        for (source_id, client) in plan.sources {
            let adapter = SourceAdapter::new(
                source_id,
                client,
                Arc::clone(&plan.request),
                cancel.observer(),
                sender.clone(),
                session.clock(),
                self.config.source_timeout,
                self.config.fragment_buffer,
            );
            adapters.spawn(adapter.run(pool.clone()));
        }
        drop(sender);
        info!(
            pool_size = pool.size(),
            channel_capacity = receiver.capacity(),
            source_timeout_ms = self.config.source_timeout.as_millis() as u64,
            "session streaming"
        );
        self.transition(EmitterState::Streaming);

        let result = self
            .stream(&mut session, &mut receiver, sink, &cancel)
            .await;
        if let Err(error) = result {
            cancel.cancel();
            warn!(%error, "session aborted");
            return Err(error);
        }

        self.transition(EmitterState::Draining);
        receiver.close();
        debug!(leftover = receiver.buffered(), "draining event channel");
        while let Some(event) = receiver.recv().await {
            debug!(source_id = %event.source_id, sequence = event.sequence, "dropping event after session end");
            self.dropped += 1;
        }
        adapters.shutdown().await;
        sink.finish().await.map_err(AggregatorError::from)?;
        self.transition(EmitterState::Finished);

        let report = session.into_report(self.forwarded, self.dropped);
        info!(
            completed = report.completed_count(),
            failed = report.failed_count(),
            forwarded = report.events_forwarded,
            dropped = report.events_dropped,
            elapsed_ms = report.elapsed_ms,
            cancelled = report.cancelled,
            "session finished"
        );
        Ok(report)
    }

    async fn stream<S>(
        &mut self,
        session: &mut RequestSession,
        receiver: &mut EventReceiver,
        sink: &mut S,
        cancel: &CancellationController,
    ) -> AggregatorResult<()>
    where
        S: EventSink + ?Sized,
    {
        let mut grace_deadline: Option<Instant> = None;

        while !session.all_done() {
            let grace_at = grace_deadline;
            let grace = async move {
                match grace_at {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            let streaming = self.state == EmitterState::Streaming;

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if streaming => {
                    self.transition(EmitterState::Cancelling);
                    grace_deadline = Some(Instant::now() + self.config.cancel_grace);
                    info!(
                        unfinished = session.unfinished().len(),
                        grace_ms = self.config.cancel_grace.as_millis() as u64,
                        "session cancelled; waiting for in-flight terminal events"
                    );
                }
                _ = grace => {
                    let unfinished = session.unfinished();
                    warn!(?unfinished, "cancel grace period elapsed");
                    self.close_unfinished(session, sink, |source_id| {
                        AggregatorError::SessionCancelled { source_id }
                    })
                    .await?;
                }
                event = receiver.recv() => match event {
                    Some(event) => self.forward(session, event, sink).await?,
                    None => {
                        let unfinished = session.unfinished();
                        warn!(?unfinished, "all adapters exited before every source finished");
                        self.close_unfinished(session, sink, |source_id| {
                            AggregatorError::SourceInvocation {
                                source_id,
                                message: "source adapter exited without a terminal event"
                                    .to_owned(),
                            }
                        })
                        .await?;
                    }
                },
            }
        }
        Ok(())
    }

    async fn forward<S>(
        &mut self,
        session: &mut RequestSession,
        event: StreamEvent,
        sink: &mut S,
    ) -> AggregatorResult<()>
    where
        S: EventSink + ?Sized,
    {
        if let Err(rejection) = session.admit(&event) {
            warn!(
                source_id = %event.source_id,
                sequence = event.sequence,
                event_kind = event.kind.name(),
                ?rejection,
                "dropping event that breaks per-source ordering"
            );
            self.dropped += 1;
            return Ok(());
        }

        sink.send(&event).await?;
        self.forwarded += 1;
        if event.is_terminal() {
            debug!(
                source_id = %event.source_id,
                sequence = event.sequence,
                event_kind = event.kind.name(),
                "source done"
            );
        }
        Ok(())
    }

    /// Emits terminal events on behalf of sources whose adapters can no
    /// longer be waited for.
    async fn close_unfinished<S>(
        &mut self,
        session: &mut RequestSession,
        sink: &mut S,
        failure: impl Fn(SourceId) -> AggregatorError,
    ) -> AggregatorResult<()>
    where
        S: EventSink + ?Sized,
    {
        for source_id in session.unfinished() {
            let (state, next_sequence) = match session.progress(&source_id) {
                Some(progress) => (progress.state, progress.next_sequence()),
                None => continue,
            };
            let at = session.clock().elapsed();
            let mut sequence = next_sequence;
            if state == SourceState::Pending {
                self.forward(session, StreamEvent::started(source_id.clone(), at), sink)
                    .await?;
                sequence = 1;
            }
            let kind = EventKind::failed_with(&failure(source_id.clone()));
            self.forward(session, StreamEvent::new(source_id, sequence, at, kind), sink)
                .await?;
        }
        Ok(())
    }

    fn transition(&mut self, next: EmitterState) {
        debug!(from = ?self.state, to = ?next, "emitter state change");
        self.state = next;
    }
}
