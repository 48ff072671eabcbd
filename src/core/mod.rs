//! Core orchestration logic.
//!
//! This module contains:
//! - CheckpointStore: durable per-environment checkpoints and records
//! - Journal: append-only audit log of run transitions
//! - Plan: plan definitions and loading
//! - RetryPolicy: bounded retry of transient failures
//! - PlanRunner: main execution engine

pub mod checkpoint_store;
pub mod journal;
pub mod plan;
pub mod retry;
pub mod roles;
pub mod runner;

// Re-export commonly used types
pub use checkpoint_store::CheckpointStore;
pub use journal::Journal;
pub use plan::{Arg, Plan, Step, StepAction};
pub use retry::{Attempted, RetryError, RetryPolicy};
pub use roles::role_hash;
pub use runner::PlanRunner;
