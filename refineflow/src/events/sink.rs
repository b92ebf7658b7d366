//! Event sink trait and implementations.

use super::RunnerEvent;
use async_trait::async_trait;
use tracing::{debug, info, Level};

/// Receives runner events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &RunnerEvent);

    /// Emits an event without blocking. Failures are swallowed.
    fn try_emit(&self, event: &RunnerEvent);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &RunnerEvent) {}

    fn try_emit(&self, _event: &RunnerEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::DEBUG }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub const fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event: &RunnerEvent) {
        let data = serde_json::to_string(event).unwrap_or_default();
        if self.level == Level::DEBUG {
            debug!(event_type = event.event_type(), event_data = %data, "Event: {}", event.event_type());
        } else {
            info!(event_type = event.event_type(), event_data = %data, "Event: {}", event.event_type());
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &RunnerEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &RunnerEvent) {
        self.log_event(event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<RunnerEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<RunnerEvent> {
        self.events.read().clone()
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

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<RunnerEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &RunnerEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &RunnerEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stage;
    use uuid::Uuid;

    fn started() -> RunnerEvent {
        RunnerEvent::Started {
            run_id: Uuid::new_v4(),
            stage: Stage::Critique,
            total: 3,
            pending: 2,
        }
    }

    fn dropped() -> RunnerEvent {
        RunnerEvent::ItemDropped {
            run_id: Uuid::new_v4(),
            key: "k".to_string(),
            error: "exhausted".to_string(),
        }
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpEventSink.emit(&started()).await;
        LoggingEventSink::info().emit(&started()).await;
        LoggingEventSink::debug().try_emit(&dropped());
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&started()).await;
        sink.try_emit(&dropped());

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events()[0].event_type(), "runner.started");
        assert_eq!(sink.events_of_type("item.").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
