//! Error taxonomy for deployment runs.
//!
//! Remote failures are classified as transient or fatal by the chain
//! client. The runner only ever retries transient ones; everything else
//! aborts the run after the checkpoint has been flushed.

use std::path::PathBuf;

use thiserror::Error;

/// How a remote failure should be treated by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, timeout or consensus delay; safe to re-attempt
    Transient,

    /// Explicitly rejected by the ledger; never re-attempted
    Fatal,
}

/// Anything that can say whether it is worth retrying
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Failure surfaced by a chain client
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("invalid operation: {0}")]
    InvalidArguments(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// The client itself is misconfigured or returned garbage
    #[error("chain client error: {0}")]
    Client(String),
}

impl Classify for ChainError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable(_) | Self::Timeout { .. } => ErrorClass::Transient,
            Self::Rejected(_)
            | Self::InvalidArguments(_)
            | Self::InsufficientBalance(_)
            | Self::Client(_) => ErrorClass::Fatal,
        }
    }
}

/// Failure reading or writing durable checkpoint state
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("archive record already exists: {}", .0.display())]
    ArchiveExists(PathBuf),

    #[error("journal write failed: {0}")]
    Journal(String),
}

/// Reason a run was aborted
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("step '{step}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        source: ChainError,
    },

    #[error("step '{step}' was rejected: {source}")]
    Rejected { step: String, source: ChainError },

    #[error("step '{step}' requires '{key}' which is not recorded in the checkpoint")]
    MissingDependency { step: String, key: String },

    #[error("step '{step}' expected a {expected} result from the ledger")]
    UnexpectedOutput { step: String, expected: &'static str },

    #[error("step '{step}' has an invalid argument: {message}")]
    Template { step: String, message: String },

    #[error("run cancelled during step '{step}'")]
    Cancelled { step: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error(transparent)]
    Persistence(#[from] CheckpointError),
}

impl DeployError {
    /// Ordering errors are programming mistakes in the plan, not ledger failures
    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::MissingDependency { .. })
    }

    /// Process exit code for a run aborted with this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled { .. } => 130,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_error_classes() {
        assert_eq!(
            ChainError::Unavailable("503".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ChainError::Timeout {
                operation: "grantRole".into(),
                seconds: 30
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ChainError::Rejected("CONTRACT_REVERT_EXECUTED".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            ChainError::InsufficientBalance("payer".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_exit_codes() {
        let cancelled = DeployError::Cancelled {
            step: "Timelock".into(),
        };
        assert_eq!(cancelled.exit_code(), 130);

        let missing = DeployError::MissingDependency {
            step: "Router".into(),
            key: "Factory".into(),
        };
        assert_eq!(missing.exit_code(), 1);
        assert!(missing.is_ordering());
    }
}
