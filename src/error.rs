//! Error Types
//!
//! Per-task failures are captured on the task itself and only surface
//! here when a caller waits on the task or its batch.

use thiserror::Error;

/// A single task that finished in the `Failed` state.
///
/// Carries enough context to identify the invocation without access to
/// the task handle: identity, caller description, arguments and the
/// underlying error text (including any trace captured by the worker).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("task {id} ({caller}) failed with args {args}: {message}")]
pub struct TaskFailure {
    /// Identity of the failed task
    pub id: String,
    /// Command text or function name
    pub caller: String,
    /// Positional and keyword arguments rendered as JSON
    pub args: String,
    /// Error text recorded by the monitor
    pub message: String,
}

/// Errors produced by the orchestration engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    TaskFailed(#[from] TaskFailure),

    #[error("{failed} of {total} tasks failed")]
    BatchFailed { failed: usize, total: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
