//! Nurture event bus — trait for publishing engine lifecycle events.
//!
//! The engine accepts an `Arc<dyn EventSink>` so that assignment and step
//! outcomes can be forwarded to analytics, webhooks, or a UI feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NurtureEventType {
    Assigned,
    StepSent,
    StepSkipped,
    RetryScheduled,
    Completed,
    Aborted,
}

/// A single engine event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NurtureEvent {
    pub event_id: Uuid,
    pub event_type: NurtureEventType,
    pub sequence_id: Uuid,
    pub lead_id: String,
    pub execution_id: Uuid,
    pub step_id: Option<Uuid>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: NurtureEvent);
}

/// No-op sink for deployments that don't consume events.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: NurtureEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<NurtureEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<NurtureEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: NurtureEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: NurtureEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating a `NurtureEvent` with minimal boilerplate.
/// `timestamp` comes from the caller's clock.
pub fn make_event(
    event_type: NurtureEventType,
    sequence_id: Uuid,
    lead_id: impl Into<String>,
    execution_id: Uuid,
    step_id: Option<Uuid>,
    detail: Option<String>,
    timestamp: DateTime<Utc>,
) -> NurtureEvent {
    NurtureEvent {
        event_id: Uuid::new_v4(),
        event_type,
        sequence_id,
        lead_id: lead_id.into(),
        execution_id,
        step_id,
        detail,
        timestamp,
    }
}

/// Convenience: a no-op sink for callers that don't need events.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let seq = Uuid::new_v4();
        let exec = Uuid::new_v4();
        let at = Utc::now() - chrono::Duration::days(3);
        sink.emit(make_event(
            NurtureEventType::Assigned,
            seq,
            "lead-1",
            exec,
            None,
            None,
            at,
        ));
        sink.emit(make_event(
            NurtureEventType::StepSent,
            seq,
            "lead-1",
            exec,
            Some(Uuid::new_v4()),
            Some("whatsapp".into()),
            at,
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(NurtureEventType::Assigned), 1);
        assert_eq!(sink.count_type(NurtureEventType::StepSent), 1);

        let events = sink.events();
        assert_eq!(events[0].lead_id, "lead-1");
        assert_eq!(events[1].detail, Some("whatsapp".into()));
        assert!(events.iter().all(|e| e.timestamp == at));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        sink.emit(make_event(
            NurtureEventType::Aborted,
            Uuid::nil(),
            "lead-1",
            Uuid::nil(),
            None,
            None,
            Utc::now(),
        ));
    }
}
