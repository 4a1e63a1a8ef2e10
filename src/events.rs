//! Fire-and-forget telemetry channel for audit and analytics.
//!
//! The sink is best-effort by contract: `emit` is infallible from the
//! caller's point of view, and implementations swallow and log their own
//! failures. Sink trouble must never block or fail an assignment or a
//! result write.

use parking_lot::RwLock;

/// Named event with a property bag.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, properties: serde_json::Value);
}

/// Sink that forwards events to the `tracing` pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &str, properties: serde_json::Value) {
        tracing::info!(target: "prayog::events", event, %properties, "event");
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &str, _properties: serde_json::Value) {}
}

/// Sink that records events in memory, for assertions in tests.
#[derive(Default)]
pub struct RecordingEventSink {
    events: RwLock<Vec<(String, serde_json::Value)>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events.read().iter().map(|(n, _)| n.clone()).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &str, properties: serde_json::Value) {
        self.events.write().push((event.to_string(), properties));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_collects_in_order() {
        let sink = RecordingEventSink::new();
        sink.emit("assignment.created", serde_json::json!({"test_id": "t1"}));
        sink.emit("result.recorded", serde_json::json!({"test_id": "t1"}));

        let names = sink.names();
        assert_eq!(names, vec!["assignment.created", "result.recorded"]);
    }

    #[test]
    fn test_null_sink_is_silent() {
        let sink = NullEventSink;
        sink.emit("anything", serde_json::Value::Null);
    }
}
