//! ledger-deploy - Resumable, idempotent contract deployment orchestrator
//!
//! Runs an ordered deployment plan (contract creations, account creations,
//! queries, role grants and other configuration calls) against a ledger,
//! recording every committed step in a per-network checkpoint so that an
//! interrupted deployment can be rerun and pick up where it stopped.
//!
//! # Architecture
//!
//! - Every step has a record key; a step whose key is already recorded is
//!   skipped without a remote call
//! - The checkpoint is flushed after each committed step and before any
//!   error is returned
//! - A completed checkpoint is archived as an immutable record
//! - Run transitions are appended to a JSONL journal for auditing
//!
//! # Modules
//!
//! - `adapters`: Chain clients (external helper program, in-memory ledger)
//! - `core`: Orchestration logic (Plan, PlanRunner, CheckpointStore, Journal)
//! - `domain`: Data structures (Checkpoint, Environment, Event, Run)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Preview a plan against an in-memory ledger
//! ledger-deploy run pangolin-hedera --network testnet --dry-run
//!
//! # Deploy (rerun the same command to resume after a failure)
//! ledger-deploy run pangolin-hedera --network testnet
//!
//! # Inspect progress
//! ledger-deploy status --network testnet
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use adapters::{ChainClient, CommandClient, Operation, OperationOutput, SimulatedLedger};
pub use core::{CheckpointStore, Journal, Plan, PlanRunner, RetryPolicy, Step};
pub use domain::{Checkpoint, Environment, Event, EventType, Run, RunState, StepResult};
pub use error::{ChainError, CheckpointError, DeployError};
