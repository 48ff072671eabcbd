//! Run state and reconstruction from journal events.
//!
//! A Run represents a single invocation of a plan against one environment.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::environment::Environment;
use super::events::{Event, EventType, StepStatus};

/// A deployment run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Target network
    pub environment: Environment,

    /// Name of the plan being executed
    pub plan_name: String,

    /// Content hash of the plan
    #[serde(default)]
    pub plan_fingerprint: Option<String>,

    /// Current state of the run
    pub state: RunState,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Status of each step, keyed by record key
    pub step_statuses: BTreeMap<String, StepStatus>,

    /// Remote calls issued during this run, retries included
    pub remote_calls: u32,

    /// Archived record written on completion
    pub record_path: Option<String>,
}

impl Run {
    pub fn new(id: Uuid, environment: Environment, plan_name: impl Into<String>) -> Self {
        Self {
            id,
            environment,
            plan_name: plan_name.into(),
            plan_fingerprint: None,
            state: RunState::Running,
            started_at: Utc::now(),
            finished_at: None,
            step_statuses: BTreeMap::new(),
            remote_calls: 0,
            record_path: None,
        }
    }

    /// Reconstruct the most recent run from an environment's journal
    pub fn latest_from_events(environment: &Environment, events: &[Event]) -> Option<Self> {
        let start = events
            .iter()
            .rposition(|e| e.event_type == EventType::RunStarted)?;
        let first = &events[start];

        let mut run = Self::new(first.run_id, environment.clone(), String::new());
        run.started_at = first.timestamp;

        for event in events[start..].iter().filter(|e| e.run_id == first.run_id) {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        let step = event.step.clone();
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                if let Some(ref plan) = event.detail {
                    self.plan_name = plan.clone();
                }
                if event.fingerprint.is_some() {
                    self.plan_fingerprint = event.fingerprint.clone();
                }
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.finished_at = Some(event.timestamp);
                self.record_path = event.detail.clone();
            }
            EventType::RunAborted => {
                self.state = RunState::Aborted {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.finished_at = Some(event.timestamp);
            }
            EventType::StepSkipped | EventType::InputRecorded => {
                self.set_status(step, StepStatus::Skipped)
            }
            EventType::StepStarted => self.set_status(step, StepStatus::Executing),
            EventType::StepCommitted => {
                self.remote_calls += event.attempt.unwrap_or(1);
                self.set_status(step, StepStatus::Committed);
            }
            EventType::StepFailed => {
                self.remote_calls += event.attempt.unwrap_or(0);
                self.set_status(step, StepStatus::Failed);
            }
            EventType::CheckpointFlushed => {}
        }
    }

    pub(crate) fn set_status(&mut self, step: Option<String>, status: StepStatus) {
        if let Some(step) = step {
            self.step_statuses.insert(step, status);
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.step_statuses.values().filter(|s| **s == status).count()
    }
}

/// State of a deployment run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    #[default]
    Running,

    /// Every step recorded; checkpoint archived
    Completed,

    /// Stopped on a failure or cancellation; checkpoint left resumable
    Aborted { error: String },
}
