//! Lifecycle events for observability.
//!
//! The DAG executor emits `run.*` and `stage.*` events to the run's
//! [`EventSink`]; the default sink discards them.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The event type (e.g., "stage.started").
    #[serde(rename = "type")]
    pub event_type: String,
    /// The run that emitted the event.
    pub run_id: Uuid,
    /// The stage the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// Creates a new event stamped with the current time.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        event_type: impl Into<String>,
        stage: Option<&str>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            run_id,
            stage: stage.map(str::to_string),
            data,
            timestamp: Utc::now(),
        }
    }
}
