//! Event types emitted by the aggregator.
//!
//! Every event is attributed to exactly one source and carries that
//! source's sequence number. Per source the stream is always
//! `Started`, zero or more `Fragment`s, then one terminal event
//! (`Completed` or `Failed`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AggregatorError;
use crate::ids::SourceId;

/// Monotonic sequence number within one source. Starts at 0.
pub type SeqNo = u64;

/// One attributed unit of output on the outbound stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub source_id: SourceId,
    pub sequence: SeqNo,
    /// Monotonic offset from the start of the request session.
    #[serde(rename = "emitted_at_us", with = "duration_micros")]
    pub emitted_at: Duration,
    /// Wall clock time, for display only. Ordering uses `emitted_at`.
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl StreamEvent {
    pub fn new(source_id: SourceId, sequence: SeqNo, emitted_at: Duration, kind: EventKind) -> Self {
        Self {
            source_id,
            sequence,
            emitted_at,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn started(source_id: SourceId, emitted_at: Duration) -> Self {
        Self::new(source_id, 0, emitted_at, EventKind::Started)
    }

    pub fn fragment(
        source_id: SourceId,
        sequence: SeqNo,
        emitted_at: Duration,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            source_id,
            sequence,
            emitted_at,
            EventKind::Fragment { text: text.into() },
        )
    }

    pub fn completed(source_id: SourceId, sequence: SeqNo, emitted_at: Duration) -> Self {
        Self::new(source_id, sequence, emitted_at, EventKind::Completed)
    }

    pub fn failed(
        source_id: SourceId,
        sequence: SeqNo,
        emitted_at: Duration,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            source_id,
            sequence,
            emitted_at,
            EventKind::Failed {
                reason,
                message: message.into(),
            },
        )
    }

    /// `Completed` and `Failed` end a source's stream.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Fragment text or failure description. `None` for `Started`/`Completed`.
    pub fn payload(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Fragment { text } => Some(text),
            EventKind::Failed { message, .. } => Some(message),
            EventKind::Started | EventKind::Completed => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.kind {
            EventKind::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Fragment { text: String },
    Completed,
    Failed { reason: FailureReason, message: String },
}

impl EventKind {
    /// The `Failed` event for a source-scoped error. Session-level errors
    /// are reported as invocation failures.
    pub fn failed_with(error: &AggregatorError) -> Self {
        Self::Failed {
            reason: error.failure_reason().unwrap_or(FailureReason::Invocation),
            message: error.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Fragment { .. } => "fragment",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Why a source ended with `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The per-source timeout elapsed before the source finished.
    Timeout,
    /// The source client returned an error or its worker died.
    Invocation,
    /// The session was cancelled before the source finished.
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Invocation => "invocation",
            Self::Cancelled => "cancelled",
        }
    }
}

mod duration_micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let micros = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
        serializer.serialize_u64(micros)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fragment_serializes_with_type_tag() {
        let event = StreamEvent::fragment("fast".into(), 2, Duration::from_millis(3), "hello");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["source_id"], "fast");
        assert_eq!(value["sequence"], 2);
        assert_eq!(value["emitted_at_us"], 3_000);
        assert_eq!(value["kind"], json!({ "type": "fragment", "text": "hello" }));
    }

    #[test]
    fn failure_kind_follows_the_error_taxonomy() {
        let timeout = AggregatorError::SourceTimeout {
            source_id: "slow".into(),
            timeout_ms: 150,
        };
        assert_eq!(
            EventKind::failed_with(&timeout),
            EventKind::Failed {
                reason: FailureReason::Timeout,
                message: "source slow timed out after 150ms".to_owned(),
            }
        );

        let cancelled = AggregatorError::SessionCancelled {
            source_id: "fast".into(),
        };
        assert!(matches!(
            EventKind::failed_with(&cancelled),
            EventKind::Failed { reason: FailureReason::Cancelled, .. }
        ));
    }

    #[test]
    fn failed_carries_reason_and_message() {
        let event = StreamEvent::failed(
            "slow".into(),
            4,
            Duration::ZERO,
            FailureReason::Timeout,
            "no terminal event within 45s",
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"]["type"], "failed");
        assert_eq!(value["kind"]["reason"], "timeout");
        assert_eq!(event.payload(), Some("no terminal event within 45s"));
        assert_eq!(event.failure_reason(), Some(FailureReason::Timeout));
        assert!(event.is_terminal());
    }

    #[test]
    fn started_and_completed_have_no_payload() {
        let started = StreamEvent::started("a".into(), Duration::ZERO);
        let completed = StreamEvent::completed("a".into(), 1, Duration::ZERO);
        assert_eq!(started.sequence, 0);
        assert!(started.payload().is_none());
        assert!(!started.is_terminal());
        assert!(completed.payload().is_none());
        assert!(completed.is_terminal());
    }

    #[test]
    fn event_deserializes_from_wire_shape() {
        let raw = json!({
            "source_id": "broken",
            "sequence": 1,
            "emitted_at_us": 250,
            "timestamp": "2026-01-01T00:00:00Z",
            "kind": { "type": "failed", "reason": "invocation", "message": "boom" }
        });
        let event: StreamEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.emitted_at, Duration::from_micros(250));
        assert_eq!(event.kind.name(), "failed");
        assert_eq!(event.failure_reason(), Some(FailureReason::Invocation));
    }
}
