//! Error types for the scheduling core.
//!
//! Library operations return [`GridResult`]. Driver and store failures keep
//! their own error types and are wrapped here when they cross into the
//! scheduler. Application-edge code (CLI, config loading) uses `anyhow`.

use thiserror::Error;

use crate::driver::DriverError;
use crate::store::StoreError;

/// Result type alias using [`GridError`].
pub type GridResult<T> = std::result::Result<T, GridError>;

/// Errors surfaced by the queue, pool, engine and suite orchestrator.
#[derive(Error, Debug)]
pub enum GridError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Test queue is full (max {max})")]
    QueueFull { max: usize },

    #[error("Worker pool exhausted (max {max})")]
    PoolExhausted { max: usize },

    #[error("Worker {0} is not idle")]
    WorkerBusy(String),

    #[error("Test {0} is already queued or running")]
    AlreadySubmitted(String),

    #[error("Step {index} failed: {message}")]
    StepExecutionFailure { index: usize, message: String },

    #[error("Precondition failed: {0}")]
    PreconditionFailure(String),

    #[error("Postcondition failed: {0}")]
    PostconditionFailure(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl GridError {
    pub fn test_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Test",
            id: id.into(),
        }
    }

    pub fn worker_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Worker",
            id: id.into(),
        }
    }

    pub fn suite_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Suite",
            id: id.into(),
        }
    }

    /// Returns true for capacity rejections the caller may retry later.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::PoolExhausted { .. })
    }
}
