//! Error types for toolpipe.
//!
//! Library crates use [`ToolpipeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::TaskId;

/// Boxed cause returned by external capabilities and resolvers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error type for all toolpipe operations.
#[derive(Debug, thiserror::Error)]
pub enum ToolpipeError {
    /// A stage's delegated action failed.
    #[error("stage '{stage}' failed for task {task_id}: {source}")]
    StageExecution {
        stage: String,
        task_id: TaskId,
        source: BoxError,
    },

    /// Capability resolution, or the resolved capability, failed.
    #[error("conversion in stage '{stage}' failed for task {task_id}: {source}")]
    Conversion {
        stage: String,
        task_id: TaskId,
        source: BoxError,
    },

    /// Routing found no pipeline to run.
    #[error("no pipeline available")]
    NoPipelineAvailable,

    /// A named pipeline is not registered.
    #[error("pipeline '{name}' not found")]
    PipelineNotFound { name: String },

    /// The audit sink rejected a stage result.
    #[error("failed to persist result of stage '{stage}' for task {task_id}: {message}")]
    Persistence {
        stage: String,
        task_id: TaskId,
        message: String,
    },

    /// The run was cancelled while `stage` was pending or in flight.
    #[error("task {task_id} cancelled at stage '{stage}'")]
    Cancelled { stage: String, task_id: TaskId },

    /// A stage exceeded its deadline.
    #[error("stage '{stage}' timed out after {timeout_ms}ms for task {task_id}")]
    Timeout {
        stage: String,
        task_id: TaskId,
        timeout_ms: u64,
    },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ToolpipeError>;

impl ToolpipeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Task the failure belongs to, when it happened inside a traversal.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::StageExecution { task_id, .. }
            | Self::Conversion { task_id, .. }
            | Self::Persistence { task_id, .. }
            | Self::Cancelled { task_id, .. }
            | Self::Timeout { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Stage that failed, when the failure is stage-local.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageExecution { stage, .. }
            | Self::Conversion { stage, .. }
            | Self::Persistence { stage, .. }
            | Self::Cancelled { stage, .. }
            | Self::Timeout { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Short machine-readable name of the variant, used in structured reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StageExecution { .. } => "stage_execution",
            Self::Conversion { .. } => "conversion",
            Self::NoPipelineAvailable => "no_pipeline_available",
            Self::PipelineNotFound { .. } => "pipeline_not_found",
            Self::Persistence { .. } => "persistence",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Config { .. } => "config",
            Self::Storage(_) => "storage",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
        }
    }
}
