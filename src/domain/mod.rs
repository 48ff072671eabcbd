//! Domain types for the deployment orchestrator.
//!
//! - Environment: target network identity
//! - Checkpoint: durable record of committed steps
//! - Events: journal entries for run transitions
//! - Run: deployment run state

pub mod checkpoint;
pub mod environment;
pub mod events;
pub mod run;

pub use checkpoint::{Checkpoint, RecordKey, StepResult, CONFIG_KEY};
pub use environment::{Environment, InvalidEnvironment};
pub use events::{Event, EventType, StepStatus};
pub use run::{Run, RunState};
