//! Boundaries between the aggregator and the outside world.
//!
//! - [`SourceClient`] is the uniform capability every upstream source
//!   implements. It is synchronous and may block: the runtime always calls
//!   it from a dedicated blocking worker thread.
//! - [`EventSink`] is the outbound transport. The stream emitter is its only
//!   caller.

use async_trait::async_trait;

use crate::conversation::SourceRequest;
use crate::error::{SourceError, TransportError};
use crate::event::StreamEvent;

/// Lazy, finite sequence of text fragments from one source.
///
/// An `Err` item ends the source with an invocation failure.
pub type FragmentStream = Box<dyn Iterator<Item = Result<String, SourceError>> + Send>;

pub trait SourceClient: Send + Sync {
    /// Start generating a response. May block; errors raised before the
    /// first fragment are returned here.
    fn invoke(&self, request: &SourceRequest) -> Result<FragmentStream, SourceError>;
}

#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: &StreamEvent) -> Result<(), TransportError>;

    /// Called once after the last event. Default does nothing.
    async fn finish(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl EventSink for Vec<StreamEvent> {
    async fn send(&mut self, event: &StreamEvent) -> Result<(), TransportError> {
        self.push(event.clone());
        Ok(())
    }
}
