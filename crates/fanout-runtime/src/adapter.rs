//! Per-task adapter: bridges one blocking source client onto the shared
//! event channel.
//!
//! The blocking invocation runs on a pool slot and hands each fragment to
//! the adapter through a small per-source buffer. The adapter is the only
//! writer of that source's events, so it alone assigns sequence numbers and
//! decides the single terminal event (completed, invocation error, timeout,
//! or cancellation). Nothing it does can fail the session: every failure
//! becomes a `Failed` event.
//!
//! The per-source deadline starts when the adapter starts, so time spent
//! queued for a pool slot counts against it. A fragment push blocked on a
//! full channel is raced against the deadline and cancellation; the
//! terminal event itself still waits for channel space.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use fanout_events::EventSender;
use fanout_protocol::{
    AggregatorError, EventKind, SeqNo, SourceClient, SourceError, SourceId, SourceRequest,
    StreamEvent,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, instrument, warn};

use crate::cancel::CancelObserver;
use crate::pool::{Acquired, WorkerPool};
use crate::session::SessionClock;

/// Hand-off from the blocking worker thread to its adapter.
#[derive(Debug)]
enum WorkerMessage {
    Fragment(String),
    Finished,
    Failed(SourceError),
}

#[derive(Debug)]
enum Terminal {
    Completed,
    Failed(AggregatorError),
}

/// How a fragment push ended.
enum Pushed {
    Delivered,
    Interrupted(Terminal),
    ChannelClosed,
}

pub struct SourceAdapter {
    source_id: SourceId,
    client: Arc<dyn SourceClient>,
    request: Arc<SourceRequest>,
    cancel: CancelObserver,
    events: EventSender,
    clock: SessionClock,
    timeout: Duration,
    fragment_buffer: usize,
    next_sequence: SeqNo,
}

impl SourceAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: SourceId,
        client: Arc<dyn SourceClient>,
        request: Arc<SourceRequest>,
        cancel: CancelObserver,
        events: EventSender,
        clock: SessionClock,
        timeout: Duration,
        fragment_buffer: usize,
    ) -> Self {
        Self {
            source_id,
            client,
            request,
            cancel,
            events,
            clock,
            timeout,
            fragment_buffer: fragment_buffer.max(1),
            next_sequence: 0,
        }
    }

    /// Runs the source to its terminal event. Returns once that event has
    /// been pushed, or as soon as the channel is closed.
    #[instrument(skip(self, pool), fields(source_id = %self.source_id))]
    pub async fn run(mut self, pool: WorkerPool) {
        let deadline = Instant::now() + self.timeout;
        let slot = match pool.acquire(&self.cancel, deadline).await {
            Acquired::Slot(slot) => slot,
            Acquired::Cancelled => {
                debug!("cancelled while queued for a worker slot");
                self.skip(self.cancelled_error()).await;
                return;
            }
            Acquired::Expired => {
                warn!(
                    timeout_ms = self.timeout_ms(),
                    "source timed out while queued for a worker slot"
                );
                self.skip(self.timeout_error()).await;
                return;
            }
        };

        if !self.emit(EventKind::Started).await {
            return;
        }
        debug!(timeout_ms = self.timeout_ms(), "source started");

        let (fragments_tx, mut fragments_rx) = mpsc::channel(self.fragment_buffer);
        let mut worker = Some({
            let client = Arc::clone(&self.client);
            let request = Arc::clone(&self.request);
            let cancel = self.cancel.clone();
            let source_id = self.source_id.clone();
            slot.spawn_blocking(move || {
                drive_client(&source_id, client.as_ref(), &request, &cancel, &fragments_tx)
            })
        });

        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        let terminal = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Terminal::Failed(self.cancelled_error()),
                _ = &mut expiry => {
                    warn!(timeout_ms = self.timeout_ms(), "source timed out");
                    break Terminal::Failed(self.timeout_error());
                }
                message = fragments_rx.recv() => match message {
                    Some(WorkerMessage::Fragment(text)) => {
                        match self.push_fragment(text, expiry.as_mut()).await {
                            Pushed::Delivered => {}
                            Pushed::Interrupted(terminal) => break terminal,
                            Pushed::ChannelClosed => return,
                        }
                    }
                    Some(WorkerMessage::Finished) => break Terminal::Completed,
                    Some(WorkerMessage::Failed(error)) => {
                        warn!(error = %error, "source invocation failed");
                        break Terminal::Failed(self.invocation_error(error.to_string()));
                    }
                    None => {
                        let message = worker_exit_message(worker.take()).await;
                        break Terminal::Failed(self.invocation_error(message));
                    }
                },
            }
        };

        // The worker notices the closed buffer on its next fragment and
        // stops; a call stuck inside the client is left to finish on its own
        // without holding the slot.
        drop(fragments_rx);
        drop(slot);
        self.finish(terminal).await;
    }

    /// Started plus a failure, for a source that never got a worker slot.
    async fn skip(&mut self, error: AggregatorError) {
        if self.emit(EventKind::Started).await {
            self.finish(Terminal::Failed(error)).await;
        }
    }

    /// Pushes one fragment unless cancellation or the deadline wins first.
    /// An interrupted push leaves the sequence number unused.
    async fn push_fragment(
        &mut self,
        text: String,
        expiry: Pin<&mut Sleep>,
    ) -> Pushed {
        let cancel = self.cancel.clone();
        let timeout_ms = self.timeout_ms();
        let timeout = self.timeout_error();
        let cancelled = self.cancelled_error();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Pushed::Interrupted(Terminal::Failed(cancelled)),
            _ = expiry => {
                warn!(timeout_ms, "source timed out waiting for channel space");
                Pushed::Interrupted(Terminal::Failed(timeout))
            }
            delivered = self.emit(EventKind::Fragment { text }) => {
                if !delivered {
                    Pushed::ChannelClosed
                } else if cancel.is_cancelled() {
                    Pushed::Interrupted(Terminal::Failed(cancelled))
                } else {
                    Pushed::Delivered
                }
            }
        }
    }

    async fn finish(&mut self, terminal: Terminal) {
        let kind = match terminal {
            Terminal::Completed => EventKind::Completed,
            Terminal::Failed(error) => EventKind::failed_with(&error),
        };
        let kind_name = kind.name();
        if self.emit(kind).await {
            debug!(
                event_kind = kind_name,
                sequence = self.next_sequence.saturating_sub(1),
                "source finished"
            );
        }
    }

    /// Pushes the next event for this source. `false` means the emitter is
    /// gone and the adapter should stop. The sequence number is consumed
    /// only once the push completes.
    async fn emit(&mut self, kind: EventKind) -> bool {
        let event = StreamEvent::new(
            self.source_id.clone(),
            self.next_sequence,
            self.clock.elapsed(),
            kind,
        );
        match self.events.push(event).await {
            Ok(()) => {
                self.next_sequence += 1;
                true
            }
            Err(closed) => {
                debug!(error = %closed, "event channel closed; adapter stopping");
                false
            }
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    fn timeout_error(&self) -> AggregatorError {
        AggregatorError::SourceTimeout {
            source_id: self.source_id.clone(),
            timeout_ms: self.timeout_ms(),
        }
    }

    fn cancelled_error(&self) -> AggregatorError {
        AggregatorError::SessionCancelled {
            source_id: self.source_id.clone(),
        }
    }

    fn invocation_error(&self, message: String) -> AggregatorError {
        AggregatorError::SourceInvocation {
            source_id: self.source_id.clone(),
            message,
        }
    }
}

async fn worker_exit_message(worker: Option<JoinHandle<()>>) -> String {
    let outcome = match worker {
        Some(handle) => handle.await,
        None => Ok(()),
    };
    let message = match outcome {
        Err(error) if error.is_panic() => "source client panicked".to_owned(),
        _ => "source worker exited without a terminal result".to_owned(),
    };
    warn!(%message, "source worker ended abnormally");
    message
}

/// Blocking body: pulls fragments from the client until it is exhausted,
/// fails, the session is cancelled, or the adapter stops listening.
fn drive_client(
    source_id: &SourceId,
    client: &dyn SourceClient,
    request: &SourceRequest,
    cancel: &CancelObserver,
    out: &mpsc::Sender<WorkerMessage>,
) {
    let fragments = match client.invoke(request) {
        Ok(fragments) => fragments,
        Err(error) => {
            let _ = out.blocking_send(WorkerMessage::Failed(error));
            return;
        }
    };

    for item in fragments {
        let message = match item {
            Ok(text) => WorkerMessage::Fragment(text),
            Err(error) => {
                let _ = out.blocking_send(WorkerMessage::Failed(error));
                return;
            }
        };
        if out.blocking_send(message).is_err() {
            debug!(%source_id, "adapter stopped listening; discarding remaining output");
            return;
        }
        if cancel.is_cancelled() {
            debug!(%source_id, "cancellation observed at fragment boundary");
            return;
        }
    }
    let _ = out.blocking_send(WorkerMessage::Finished);
}
