//! Flow lifecycle events and the sinks that receive them.

use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle points a flow reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// The run was accepted and journaled as running.
    #[serde(rename = "flow.started")]
    FlowStarted,
    /// One attempt failed; the error may still be retried.
    #[serde(rename = "flow.attempt_failed")]
    AttemptFailed,
    /// Staged output of a failed attempt was rolled back.
    #[serde(rename = "flow.rolled_back")]
    RolledBack,
    /// The run committed and journaled its outcome.
    #[serde(rename = "flow.succeeded")]
    FlowSucceeded,
    /// The run failed for good.
    #[serde(rename = "flow.failed")]
    FlowFailed,
}

impl EventKind {
    /// Dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowStarted => "flow.started",
            Self::AttemptFailed => "flow.attempt_failed",
            Self::RolledBack => "flow.rolled_back",
            Self::FlowSucceeded => "flow.succeeded",
            Self::FlowFailed => "flow.failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event of a flow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// What happened.
    pub kind: EventKind,
    /// Flow name.
    pub flow: String,
    /// Entity name.
    pub entity: String,
    /// Run identifier.
    pub run_id: Uuid,
    /// Attempt number, 0 before the first attempt starts.
    pub attempt: u32,
    /// When the event was created.
    pub timestamp: Timestamp,
    /// Event-specific payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl FlowEvent {
    /// Creates an event with an empty payload.
    #[must_use]
    pub fn new(
        kind: EventKind,
        flow: impl Into<String>,
        entity: impl Into<String>,
        run_id: Uuid,
        attempt: u32,
    ) -> Self {
        Self {
            kind,
            flow: flow.into(),
            entity: entity.into(),
            run_id,
            attempt,
            timestamp: now_utc(),
            data: serde_json::Value::Null,
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Receives flow events.
///
/// Emitting never fails the flow; sinks swallow their own errors.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers an event.
    async fn emit(&self, event: FlowEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: FlowEvent) {}
}

/// Writes events to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: FlowEvent) {
        match event.kind {
            EventKind::AttemptFailed | EventKind::FlowFailed => warn!(
                event = %event.kind,
                flow = %event.flow,
                entity = %event.entity,
                run_id = %event.run_id,
                attempt = event.attempt,
                data = %event.data,
                "flow event"
            ),
            _ => info!(
                event = %event.kind,
                flow = %event.flow,
                entity = %event.entity,
                run_id = %event.run_id,
                attempt = event.attempt,
                data = %event.data,
                "flow event"
            ),
        }
    }
}

/// Keeps events in memory; used by tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<FlowEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    #[must_use]
    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.read().clone()
    }

    /// The kinds of the received events, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.read().iter().map(|e| e.kind).collect()
    }

    /// Events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<FlowEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of events received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: FlowEvent) {
        self.events.write().push(event);
    }
}
