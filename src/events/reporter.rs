//! Reporting sink for listener failures.

use super::event::{Event, EventType, Payload};
use crate::error::EngineError;
use serde_json::json;
use uuid::Uuid;

/// Source tag on events the engine emits itself
pub const ENGINE_SOURCE: &str = "event_engine";

/// Context of a failed `handle` call
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerFailure {
    pub listener: String,
    pub event_type: EventType,
    pub event_id: Uuid,
    pub detail: String,
    /// The handler panicked rather than returning an error
    pub panicked: bool,
}

impl ListenerFailure {
    /// Reserved ERROR event describing this failure
    pub fn to_event(&self) -> Event {
        let data: Payload = [
            ("listener".to_string(), json!(self.listener)),
            ("event_type".to_string(), json!(self.event_type)),
            ("event_id".to_string(), json!(self.event_id.to_string())),
            ("error".to_string(), json!(self.detail)),
            ("panicked".to_string(), json!(self.panicked)),
        ]
        .into_iter()
        .collect();
        Event::with_source(EventType::Error, data, ENGINE_SOURCE)
    }
}

impl From<ListenerFailure> for EngineError {
    fn from(failure: ListenerFailure) -> Self {
        EngineError::ListenerFailure {
            listener: failure.listener,
            event_type: failure.event_type,
            detail: failure.detail,
        }
    }
}

/// Receives every listener failure caught by the engine
#[cfg_attr(test, mockall::automock)]
pub trait FailureReporter: Send + Sync {
    fn report(&self, failure: &ListenerFailure);
}

/// Default sink: one structured `error` record per failure
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, failure: &ListenerFailure) {
        tracing::error!(
            listener = %failure.listener,
            event_type = %failure.event_type,
            event_id = %failure.event_id,
            panicked = failure.panicked,
            error = %failure.detail,
            "Listener failed to handle event"
        );
    }
}
