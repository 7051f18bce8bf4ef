//! # fanout-protocol: shared contract for the streaming aggregator
//!
//! This crate defines the types that flow between the aggregator runtime,
//! the upstream source clients, and the outbound transports.
//!
//! It is intentionally dependency-light (no tokio, no axum) so source
//! implementations and transports can depend on it without pulling in the
//! runtime.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (RequestId, SourceId)
//! - [`event`]: StreamEvent + EventKind + FailureReason
//! - [`conversation`]: Role, ChatMessage, SourceRequest
//! - [`ports`]: SourceClient and EventSink boundaries
//! - [`error`]: SourceError, TransportError, AggregatorError

pub mod conversation;
pub mod error;
pub mod event;
pub mod ids;
pub mod ports;

pub use conversation::{ChatMessage, Role, SourceRequest};
pub use error::{AggregatorError, AggregatorResult, SourceError, TransportError};
pub use event::{EventKind, FailureReason, SeqNo, StreamEvent};
pub use ids::{RequestId, SourceId};
pub use ports::{EventSink, FragmentStream, SourceClient};
