use axum::response::sse::Event;
use fanout_protocol::{AggregatorError, StreamEvent};
use fanout_runtime::SessionReport;
use serde::Serialize;
use serde_json::json;

pub const DONE_EVENT: &str = "done";
pub const ERROR_EVENT: &str = "error";

/// One SSE message before it is handed to axum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub id: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// `event: <kind>`, `id: <source_id>:<sequence>`, the event as JSON.
    pub fn from_stream_event(event: &StreamEvent) -> Self {
        Self {
            event: event.kind.name().to_owned(),
            id: Some(format!("{}:{}", event.source_id, event.sequence)),
            data: to_json(event),
        }
    }

    pub fn done(report: &SessionReport) -> Self {
        Self {
            event: DONE_EVENT.to_owned(),
            id: None,
            data: to_json(report),
        }
    }

    pub fn error(error: &AggregatorError) -> Self {
        Self {
            event: ERROR_EVENT.to_owned(),
            id: None,
            data: json!({ "error": error.to_string() }).to_string(),
        }
    }

    pub fn into_event(self) -> Event {
        let event = Event::default().event(self.event).data(self.data);
        match self.id {
            Some(id) => event.id(id),
            None => event,
        }
    }
}

fn to_json(value: &impl Serialize) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fanout_protocol::{AggregatorError, FailureReason, StreamEvent, TransportError};
    use serde_json::Value;

    use super::SseFrame;

    #[test]
    fn fragment_frame_carries_kind_and_attribution() -> anyhow::Result<()> {
        let event = StreamEvent::fragment("swift".into(), 3, Duration::from_millis(12), "hello ");
        let frame = SseFrame::from_stream_event(&event);

        assert_eq!(frame.event, "fragment");
        assert_eq!(frame.id.as_deref(), Some("swift:3"));
        let data: Value = serde_json::from_str(&frame.data)?;
        assert_eq!(data["source_id"], "swift");
        assert_eq!(data["sequence"], 3);
        assert_eq!(data["kind"]["type"], "fragment");
        assert_eq!(data["kind"]["text"], "hello ");
        Ok(())
    }

    #[test]
    fn failure_frame_names_the_reason() -> anyhow::Result<()> {
        let event = StreamEvent::failed(
            "flaky".into(),
            2,
            Duration::from_millis(80),
            FailureReason::Timeout,
            "source did not finish within 50ms",
        );
        let frame = SseFrame::from_stream_event(&event);

        assert_eq!(frame.event, "failed");
        let data: Value = serde_json::from_str(&frame.data)?;
        assert_eq!(data["kind"]["reason"], "timeout");
        Ok(())
    }

    #[test]
    fn error_frame_has_no_id() -> anyhow::Result<()> {
        let frame = SseFrame::error(&AggregatorError::Transport(TransportError::closed()));
        assert_eq!(frame.event, "error");
        assert!(frame.id.is_none());
        let data: Value = serde_json::from_str(&frame.data)?;
        assert!(data["error"].as_str().is_some_and(|message| message.contains("closed")));
        Ok(())
    }
}
