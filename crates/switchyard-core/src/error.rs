//! Error types for Switchyard

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using SwitchyardError
pub type Result<T> = std::result::Result<T, SwitchyardError>;

/// Main error type for Switchyard operations
#[derive(Debug, Error)]
pub enum SwitchyardError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Conflict analysis or plan construction failed; fatal to the batch
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    /// A workspace could not be safely acquired
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// Transient failure while running or talking to a task process
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),

    /// Checkpoint state errors
    #[error(transparent)]
    State(#[from] StateError),

    /// Git-related errors
    #[error(transparent)]
    Git(#[from] GitError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl SwitchyardError {
    /// Create a new "other" error with a message
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error must abort the whole batch before any task runs
    pub fn is_orchestration_fatal(&self) -> bool {
        matches!(
            self,
            Self::Analysis(_) | Self::Config(_) | Self::State(_) | Self::Yaml(_) | Self::Json(_)
        )
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while analysing a batch or building its execution plan
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// Precedence edges form a cycle
    #[error("Cyclic dependency detected among tasks: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    /// A task references an id that is not part of the batch
    #[error("Task '{task}' references unknown task '{reference}'")]
    UnknownTask { task: String, reference: String },

    /// Two tasks share the same id
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    /// A task was submitted without an id
    #[error("Task id must not be empty")]
    EmptyTaskId,

    /// The batch document itself is malformed
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),
}

/// Errors raised by the environment provisioner
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// The namespace exists and was not confirmed abandoned
    #[error("Workspace namespace '{0}' already exists and is not confirmed abandoned")]
    NamespaceInUse(String),

    /// The namespace is currently leased to a running task
    #[error("Workspace namespace '{0}' is already leased")]
    AlreadyLeased(String),

    /// The backend failed to create or inspect the namespace
    #[error("Workspace backend failed for '{namespace}': {reason}")]
    Backend { namespace: String, reason: String },

    /// The provisioner circuit breaker is open
    #[error("circuit breaker open for {dependency}")]
    BreakerOpen { dependency: String },

    /// Transient backend failures exhausted the retry budget
    #[error("provisioning failed after {attempts} attempt(s): {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}

/// Transient failures in executing a task's process
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InfrastructureError {
    /// The worker process could not be started
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Waiting on or reading from the worker failed
    #[error("failed to wait for worker: {0}")]
    Wait(String),

    /// The worker was terminated by a signal
    #[error("worker terminated by signal")]
    Terminated,

    /// The worker exited with a code classified as transient
    #[error("worker exited with transient code {0}")]
    TransientExit(i32),

    /// The attempt exceeded its time limit
    #[error("worker timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The worker body panicked
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl InfrastructureError {
    /// Whether a fresh attempt may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Panicked(_))
    }
}

/// Checkpoint store errors
#[derive(Debug, Error)]
pub enum StateError {
    /// No checkpoint exists for the batch
    #[error("No checkpoint found for batch '{0}'")]
    NotFound(String),

    /// A checkpoint exists and cannot be overwritten
    #[error("Batch '{0}' already has a checkpoint; use `resume` instead")]
    AlreadyExists(String),

    /// The checkpoint file could not be decoded
    #[error("Corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A status change violates the task state machine
    #[error("Invalid transition for task '{task}': {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    /// The single writer has shut down
    #[error("Checkpoint writer is no longer running")]
    WriterClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Git-related errors
#[derive(Debug, Error)]
pub enum GitError {
    /// Repository not found
    #[error("Git repository not found at {0}")]
    RepositoryNotFound(PathBuf),

    /// Not a git repository
    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    /// Failed to open repository
    #[error("Failed to open repository: {0}")]
    OpenFailed(String),

    /// Base reference could not be resolved
    #[error("Reference not found: {0}")]
    ReferenceNotFound(String),

    /// Branch already exists
    #[error("Branch already exists: {0}")]
    BranchExists(String),

    /// Worktree operation failed
    #[error("Worktree operation failed for {name}: {reason}")]
    WorktreeFailed { name: String, reason: String },

    /// Git2 library error
    #[error("Git error: {0}")]
    Git2(#[from] git2::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_tasks() {
        let err = AnalysisError::CyclicDependency(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            err.to_string(),
            "Cyclic dependency detected among tasks: a, b"
        );
    }

    #[test]
    fn test_analysis_errors_are_fatal() {
        let err: SwitchyardError = AnalysisError::EmptyTaskId.into();
        assert!(err.is_orchestration_fatal());

        let err: SwitchyardError = InfrastructureError::Terminated.into();
        assert!(!err.is_orchestration_fatal());
    }

    #[test]
    fn test_panics_are_not_retryable() {
        assert!(InfrastructureError::Timeout { secs: 5 }.is_retryable());
        assert!(InfrastructureError::TransientExit(75).is_retryable());
        assert!(!InfrastructureError::Panicked("boom".to_string()).is_retryable());
    }
}
