//! Error types of the pool, the executor and the operations it runs.

use std::{io, time::Duration};
use thiserror::Error;

/// Invalid construction parameters. Only ever returned at construction time.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,
    #[error("task timeout must be greater than zero")]
    ZeroTimeout,
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
}

impl ConfigError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::ZeroWorkers => "config_zero_workers",
            ConfigError::ZeroCapacity => "config_zero_capacity",
            ConfigError::ZeroTimeout => "config_zero_timeout",
            ConfigError::InvalidEnv { .. } => "config_invalid_env",
        }
    }
}

/// Why a task was not accepted by the pool.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum SubmitError {
    /// Root token fired; the pool no longer accepts or runs tasks.
    #[error("pool is shut down")]
    Closed,
    /// Queue is full (only from `try_submit`).
    #[error("task queue is full")]
    Full,
}

/// Error reported by an operation itself.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The operation noticed its own deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The operation noticed its scope was cancelled by the parent.
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Terminal classification of a failed task run.
///
/// `DeadlineExceeded` is the deadline-specific failure; every other variant
/// counts as an ordinary failure.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TaskError {
    #[error("deadline of {timeout:?} exceeded")]
    DeadlineExceeded { timeout: Duration },
    #[error("operation failed: {error}")]
    Failed { error: String },
    #[error("parent scope cancelled")]
    Cancelled,
    #[error("operation panicked: {0}")]
    Panic(String),
}

impl TaskError {
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::DeadlineExceeded { .. } => "task_deadline_exceeded",
            TaskError::Failed { .. } => "task_failed",
            TaskError::Cancelled => "task_cancelled",
            TaskError::Panic(_) => "task_panic",
        }
    }

    #[inline]
    pub fn is_deadline(&self) -> bool {
        matches!(self, TaskError::DeadlineExceeded { .. })
    }
}
