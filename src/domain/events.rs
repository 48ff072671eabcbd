//! Journal entries describing run transitions.
//!
//! The journal is an audit trail only. Whether a step is skipped is decided
//! by the checkpoint, never by replaying these events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in an environment's append-only journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Step record key (if applicable)
    pub step: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary
    pub message: String,

    /// Attempts used by a committed or failed step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for committed steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Plan name on run start, archive path on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Content hash of the plan (run start only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        step: Option<String>,
        event_type: EventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step,
            event_type,
            message: message.into(),
            attempt: None,
            duration_ms: None,
            error: None,
            detail: None,
            fingerprint: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Types of events that can occur during a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunAborted,

    /// Value seeded from plan inputs without a remote call
    InputRecorded,

    /// Already recorded in the checkpoint
    StepSkipped,

    /// Remote call issued
    StepStarted,

    /// Result recorded and saved
    StepCommitted,

    StepFailed,

    /// Checkpoint flushed after an abort or cancellation
    CheckpointFlushed,
}

/// Per-step state within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Skipped,
    Executing,
    Committed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("Timelock".to_string()),
            EventType::StepStarted,
            "Creating Timelock",
        )
        .with_attempt(1);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"step_started\""));
        assert!(!json.contains("duration_ms"));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.attempt, Some(1));
    }

    #[test]
    fn test_event_with_error() {
        let event = Event::new(Uuid::new_v4(), None, EventType::RunAborted, "aborted")
            .with_error("ledger unavailable: 503");
        assert_eq!(event.error.as_deref(), Some("ledger unavailable: 503"));
    }
}
