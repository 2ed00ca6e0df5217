//! Event sink trait and implementations.

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

/// One lifecycle event of a stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageEvent {
    /// Event type, one of [`crate::events::types`].
    pub event_type: String,
    /// Stage that emitted the event.
    pub stage: String,
    /// Run identifier of the emitting reconciler.
    pub run_id: String,
    /// Pass number, starting at 1; 0 outside of a pass.
    pub pass: u64,
    /// Event payload.
    pub data: Value,
    /// Emission time.
    pub timestamp: String,
}

impl StageEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        event_type: impl Into<String>,
        stage: impl Into<String>,
        run_id: impl Into<String>,
        pass: u64,
        data: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            stage: stage.into(),
            run_id: run_id.into(),
            pass,
            data,
            timestamp: crate::utils::iso_timestamp(),
        }
    }
}

/// Receives stage events.
///
/// Emission must never fail or block the pass: implementations swallow
/// their own errors.
pub trait EventSink: Send + Sync {
    /// Emits an event.
    fn emit(&self, event: StageEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: StageEvent) {}
}

/// Logs events through `tracing`.
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
    /// Creates a logging sink with the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event: StageEvent) {
        let StageEvent {
            event_type,
            stage,
            pass,
            data,
            ..
        } = &event;
        match self.level {
            Level::DEBUG | Level::TRACE => {
                debug!(event_type = %event_type, stage = %stage, pass, data = %data, "Event: {}", event_type);
            }
            Level::WARN | Level::ERROR => {
                warn!(event_type = %event_type, stage = %stage, pass, data = %data, "Event: {}", event_type);
            }
            _ => {
                info!(event_type = %event_type, stage = %stage, pass, data = %data, "Event: {}", event_type);
            }
        }
    }
}

/// Keeps every event in memory; used by tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<StageEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StageEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event types in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.event_type.clone()).collect()
    }

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<StageEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: StageEvent) {
        self.events.write().push(event);
    }
}
