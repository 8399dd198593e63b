//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for Switchyard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version of the config schema
    #[serde(rename = "$schema")]
    pub schema: Option<String>,

    /// Worker pool and task execution settings
    pub execution: ExecutionConfig,

    /// Retry policy for infrastructure failures
    pub retry: RetryConfig,

    /// Circuit breaker settings
    pub breaker: BreakerConfig,

    /// Isolated workspace settings
    pub workspace: WorkspaceConfig,

    /// Checkpoint storage
    pub state: StateConfig,

    /// Optional ticket tracker sink
    pub tracker: TrackerConfig,
}

/// Worker pool and task execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum concurrently running tasks
    pub concurrency: usize,

    /// Per-attempt time limit
    pub task_timeout_secs: Option<u64>,

    /// Shell used to run task commands
    pub shell: String,

    /// Exit codes treated as infrastructure errors (retried) rather than task failures
    pub transient_exit_codes: Vec<i32>,

    /// Skip tasks whose predecessor did not succeed
    pub skip_dependents_of_failed: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            task_timeout_secs: None,
            shell: "sh".to_string(),
            transient_exit_codes: vec![75],
            skip_dependents_of_failed: true,
        }
    }
}

/// Retry policy for infrastructure failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Base delay for exponential backoff (milliseconds)
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay (milliseconds)
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// Time the breaker stays open before allowing a trial call
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// Which backend materializes task workspaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceBackendKind {
    /// Branch plus worktree per task
    #[default]
    Git,
    /// Plain directory per task
    Directory,
}

impl std::fmt::Display for WorkspaceBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

impl std::str::FromStr for WorkspaceBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "git" | "worktree" => Ok(Self::Git),
            "directory" | "dir" => Ok(Self::Directory),
            _ => Err(format!("Unknown workspace backend: {}", s)),
        }
    }
}

/// Isolated workspace settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Backend implementation
    pub backend: WorkspaceBackendKind,

    /// Directory holding all task workspaces
    pub root: PathBuf,

    /// Prefix for per-task branches
    pub branch_prefix: String,

    /// Reference new branches start from
    pub base_ref: String,

    /// Keep task branches after their worktree is removed
    pub keep_branches: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            backend: WorkspaceBackendKind::Git,
            root: PathBuf::from(".switchyard/workspaces"),
            branch_prefix: "switchyard".to_string(),
            base_ref: "HEAD".to_string(),
            keep_branches: true,
        }
    }
}

/// Checkpoint storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding checkpoints and event journals
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".switchyard/state"),
        }
    }
}

/// Optional ticket tracker sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Whether status records are emitted
    pub enabled: bool,

    /// JSON-lines file receiving status records
    pub outbox: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            outbox: PathBuf::from(".switchyard/tracker.jsonl"),
        }
    }
}
