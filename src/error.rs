//! Error types for the epic conductor.

use thiserror::Error;

use crate::task::TaskStatus;

/// Top-level error type for orchestration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The work-item store could not be reached (or timed out).
    ///
    /// Fatal to the current orchestration step; no partial progress is assumed.
    #[error("work-item store unavailable: {0}")]
    StoreUnavailable(String),

    /// A compare-and-swap status transition lost a race.
    #[error("conflict on {task_id}: expected status {expected}, found {actual}")]
    Conflict {
        task_id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// The requested task or epic does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Adding a dependency edge would close a cycle.
    #[error("dependency cycle detected: {0}")]
    DependencyCycle(String),

    /// The store answered but the command failed or its output was unreadable.
    #[error("work-item store error: {0}")]
    Store(String),

    /// An executor could not be run or its output could not be read.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true when the whole step may be retried after re-reading the store.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Conflict { .. })
    }
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;
