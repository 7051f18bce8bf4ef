use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use fanout_protocol::{EventSink, StreamEvent, TransportError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

/// The consumer side has gone away; the event could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "event channel closed (dropped {} #{} for {})",
    .0.kind.name(),
    .0.sequence,
    .0.source_id
)]
pub struct ChannelClosed(pub StreamEvent);

/// Creates the shared event channel for one request session.
///
/// Bounded: once `capacity` events are buffered, `push` waits until the
/// consumer catches up. A capacity of 0 is bumped to 1.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let capacity = capacity.max(1);
    let (sender, receiver) = mpsc::channel(capacity);
    debug!(capacity, "event channel created");
    (
        EventSender { inner: sender },
        EventReceiver {
            inner: receiver,
            capacity,
        },
    )
}

/// Producer handle. Cheap to clone, one per adapter.
#[derive(Clone, Debug)]
pub struct EventSender {
    inner: mpsc::Sender<StreamEvent>,
}

impl EventSender {
    pub async fn push(&self, event: StreamEvent) -> Result<(), ChannelClosed> {
        trace!(
            source_id = %event.source_id,
            sequence = event.sequence,
            event_kind = event.kind.name(),
            "pushing event"
        );
        self.inner
            .send(event)
            .await
            .map_err(|error| ChannelClosed(error.0))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// The single consumer side, owned by the stream emitter.
#[derive(Debug)]
pub struct EventReceiver {
    inner: mpsc::Receiver<StreamEvent>,
    capacity: usize,
}

impl EventReceiver {
    /// Next event, or `None` once every sender is dropped and the buffer is
    /// empty.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.inner.recv().await
    }

    /// Stops accepting new events; buffered ones can still be received.
    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffered(&self) -> usize {
        self.inner.len()
    }
}

/// An [`EventSink`] that forwards into a bounded channel, for transports
/// that consume events as a stream (SSE, websockets).
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<StreamEvent>,
    consumer: watch::Receiver<()>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, SinkStream) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (alive, consumer) = watch::channel(());
        (
            Self { sender, consumer },
            SinkStream {
                inner: ReceiverStream::new(receiver),
                _alive: alive,
            },
        )
    }

    /// Resolves once the [`SinkStream`] has been dropped, e.g. when the
    /// client disconnects. Does not keep the stream open.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut consumer = self.consumer.clone();
        async move { while consumer.changed().await.is_ok() {} }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, event: &StreamEvent) -> Result<(), TransportError> {
        self.sender
            .send(event.clone())
            .await
            .map_err(|_| TransportError::closed())
    }
}

/// Receiving half of a [`ChannelSink`]. Ends once the sink is dropped and
/// the buffer is drained.
#[derive(Debug)]
pub struct SinkStream {
    inner: ReceiverStream<StreamEvent>,
    _alive: watch::Sender<()>,
}

impl Stream for SinkStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
