//! Error types for the aggregator protocol.

use thiserror::Error;

use crate::event::FailureReason;
use crate::ids::SourceId;

/// Errors a source client reports, either from `invoke` or mid-stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("upstream rejected the request: {0}")]
    Rejected(String),
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
    #[error("{0}")]
    Other(String),
}

/// The outbound transport could not accept an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn closed() -> Self {
        Self("outbound transport closed".to_owned())
    }
}

/// Aggregator error taxonomy.
///
/// The three source-scoped variants are recovered locally and become a
/// `Failed` event; `Transport` ends the session and reaches the caller.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("source {source_id} timed out after {timeout_ms}ms")]
    SourceTimeout { source_id: SourceId, timeout_ms: u64 },
    #[error("source {source_id} failed: {message}")]
    SourceInvocation { source_id: SourceId, message: String },
    #[error("source {source_id} cancelled before completion")]
    SessionCancelled { source_id: SourceId },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown source: {0}")]
    UnknownSource(SourceId),
    #[error("session task aborted: {0}")]
    Aborted(String),
}

impl AggregatorError {
    /// Failure reason for source-scoped errors; `None` for session-level ones.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::SourceTimeout { .. } => Some(FailureReason::Timeout),
            Self::SourceInvocation { .. } => Some(FailureReason::Invocation),
            Self::SessionCancelled { .. } => Some(FailureReason::Cancelled),
            Self::Transport(_)
            | Self::InvalidRequest(_)
            | Self::UnknownSource(_)
            | Self::Aborted(_) => None,
        }
    }
}

/// Convenience result type for aggregator operations.
pub type AggregatorResult<T> = Result<T, AggregatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_scoped_errors_map_to_failure_reasons() {
        let timeout = AggregatorError::SourceTimeout {
            source_id: "slow".into(),
            timeout_ms: 45_000,
        };
        assert_eq!(timeout.failure_reason(), Some(FailureReason::Timeout));
        assert_eq!(timeout.to_string(), "source slow timed out after 45000ms");

        let cancelled = AggregatorError::SessionCancelled {
            source_id: "a".into(),
        };
        assert_eq!(cancelled.failure_reason(), Some(FailureReason::Cancelled));
    }

    #[test]
    fn transport_errors_are_not_source_scoped() {
        let error = AggregatorError::from(TransportError::closed());
        assert!(error.failure_reason().is_none());
        assert_eq!(error.to_string(), "transport error: outbound transport closed");
    }
}
