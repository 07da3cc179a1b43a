//! Stream frames: `{ type, data, index? }`.

use axum::response::sse::Event;
use serde::Serialize;
use serde_json::{json, Value};

use tether_core::events::RunnerEvent;
use tether_engine::EventRunner;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    /// Present only for events that came out of a runner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

impl StreamFrame {
    fn synthetic(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            index: None,
        }
    }

    pub fn keepalive() -> Self {
        Self::synthetic("keepalive", json!({}))
    }

    pub fn buffer_gap(requested_from: u64, first_available: u64) -> Self {
        Self::synthetic(
            "buffer_gap",
            json!({
                "requestedFrom": requested_from,
                "firstAvailable": first_available,
                "lost": first_available.saturating_sub(requested_from),
            }),
        )
    }

    pub fn reconnect_complete(runner: &EventRunner) -> Self {
        Self::synthetic(
            "reconnect_complete",
            json!({
                "operationId": runner.operation_id(),
                "sessionId": runner.session_id(),
                "status": runner.status(),
                "eventCount": runner.event_count(),
            }),
        )
    }

    pub fn to_sse(&self) -> Event {
        let event = Event::default().data(serde_json::to_string(self).unwrap_or_default());
        match self.index {
            Some(index) => event.id(index.to_string()),
            None => event,
        }
    }
}

impl From<&RunnerEvent> for StreamFrame {
    fn from(event: &RunnerEvent) -> Self {
        Self {
            kind: event.event_type().to_string(),
            data: event.payload.data(),
            index: Some(event.index),
        }
    }
}
