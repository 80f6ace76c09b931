//! Event sink trait and implementations.

use super::RunEvent;
use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

/// Receives run lifecycle events.
///
/// Sinks are observers only: nothing a sink does can change the outcome
/// of a run, and failures inside a sink must be swallowed.
#[async_trait]
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &RunEvent);

    /// Emits an event without awaiting.
    fn try_emit(&self, event: &RunEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &RunEvent) {}

    fn try_emit(&self, _event: &RunEvent) {}
}

/// Writes events to `tracing`.
///
/// Failure events are always logged at `WARN`; everything else uses the
/// configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &RunEvent) {
        let stage = event.stage.map(|s| s.as_str()).unwrap_or("-");
        if event.kind.is_failure() {
            warn!(
                event_type = %event.kind,
                thread_id = %event.thread_id,
                stage,
                event_data = ?event.data,
                "Event: {}", event.kind
            );
        } else if self.level == Level::DEBUG {
            debug!(
                event_type = %event.kind,
                thread_id = %event.thread_id,
                stage,
                event_data = ?event.data,
                "Event: {}", event.kind
            );
        } else {
            info!(
                event_type = %event.kind,
                thread_id = %event.thread_id,
                stage,
                "Event: {}", event.kind
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &RunEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &RunEvent) {
        self.log_event(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<RunEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event type names, in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.read().iter().map(|e| e.kind.as_str()).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose type name starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<RunEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind.as_str().starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &RunEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &RunEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageId;
    use crate::events::EventKind;

    fn event(kind: EventKind) -> RunEvent {
        RunEvent::new(kind, "wf", "t").with_stage(StageId::Extract)
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(&event(EventKind::StageStarted)).await;
        let sink = LoggingEventSink::default();
        sink.emit(&event(EventKind::StageFailed)).await;
        LoggingEventSink::debug().try_emit(&event(EventKind::CheckpointSaved));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&event(EventKind::RunStarted)).await;
        sink.try_emit(&event(EventKind::StageStarted));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.kinds(), vec!["run.started", "stage.started"]);
    }

    #[tokio::test]
    async fn test_collecting_sink_filter_and_clear() {
        let sink = CollectingEventSink::new();
        sink.emit(&event(EventKind::StageStarted)).await;
        sink.emit(&event(EventKind::StageCompleted)).await;
        sink.emit(&event(EventKind::CheckpointSaved)).await;

        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.events_of_type("checkpoint.").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
