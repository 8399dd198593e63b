//! Task types and definitions

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a task, stable across restarts
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new task ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Classification of a unit of work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Feature,
    #[serde(alias = "bug", alias = "fix")]
    Bugfix,
    Test,
    Refactor,
    Docs,
    Chore,
    #[default]
    #[serde(other)]
    Other,
}

impl TaskKind {
    /// Returns the string representation of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Test => "test",
            Self::Refactor => "refactor",
            Self::Docs => "docs",
            Self::Chore => "chore",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources a task declares it will touch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceFootprint {
    /// Individual files
    pub files: Vec<String>,
    /// Whole directory trees
    pub directories: Vec<String>,
    /// External service identifiers (APIs, registries, ...)
    pub services: Vec<String>,
    /// Database or table identifiers
    pub databases: Vec<String>,
    /// Other shared mutable state (caches, queues, ...)
    pub shared_state: Vec<String>,
}

impl ResourceFootprint {
    /// Whether nothing is declared at all
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.directories.is_empty()
            && self.services.is_empty()
            && self.databases.is_empty()
            && self.shared_state.is_empty()
    }
}

/// Resource usage hints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Estimate {
    /// CPU cores
    pub cpu: Option<f32>,
    /// Memory in megabytes
    pub memory_mb: Option<u64>,
    /// Expected wall-clock duration
    pub duration_secs: Option<u64>,
}

/// One unit of work and its declared footprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Opaque reference to the description of the work
    #[serde(default)]
    pub source: String,

    /// Classification
    #[serde(default)]
    pub kind: TaskKind,

    /// Shell command run inside the task workspace
    #[serde(default)]
    pub command: Option<String>,

    /// Tasks that must complete before this one
    #[serde(default)]
    pub after: Vec<TaskId>,

    /// Declared resources
    #[serde(default)]
    pub resources: ResourceFootprint,

    /// Semantic feature tags; two tasks sharing a tag overlap
    #[serde(default)]
    pub features: Vec<String>,

    /// Explicit caller-supplied semantic conflicts
    #[serde(default)]
    pub conflicts_with: Vec<TaskId>,

    /// Resource usage hints
    #[serde(default)]
    pub estimate: Estimate,
}

impl Task {
    /// Create a new task with an empty footprint
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            source: String::new(),
            kind: TaskKind::default(),
            command: None,
            after: Vec::new(),
            resources: ResourceFootprint::default(),
            features: Vec::new(),
            conflicts_with: Vec::new(),
            estimate: Estimate::default(),
        }
    }

    /// Set the command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Set the classification
    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the source descriptor
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Add a file to the footprint
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.resources.files.push(path.into());
        self
    }

    /// Add a directory to the footprint
    pub fn with_directory(mut self, path: impl Into<String>) -> Self {
        self.resources.directories.push(path.into());
        self
    }

    /// Add an external service to the footprint
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.resources.services.push(service.into());
        self
    }

    /// Add a database or table to the footprint
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.resources.databases.push(database.into());
        self
    }

    /// Add a semantic feature tag
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    /// Require another task to complete first
    pub fn after(mut self, id: impl Into<TaskId>) -> Self {
        self.after.push(id.into());
        self
    }

    /// Declare an explicit semantic conflict
    pub fn conflicts_with(mut self, id: impl Into<TaskId>) -> Self {
        self.conflicts_with.push(id.into());
        self
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Analyzing,
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    /// Returns the string representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the task has reached an end state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Check if this status represents success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Whether a resumed batch should run this task again
    pub fn needs_rerun(&self) -> bool {
        !self.is_terminal() || *self == Self::Cancelled
    }

    /// Whether the state machine allows moving to `next`.
    ///
    /// `running -> queued` and `cancelled -> queued` only happen when a batch
    /// is resumed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Analyzing | Queued | Skipped | Cancelled) => true,
            (Analyzing, Queued | Skipped | Cancelled) => true,
            (Queued, Queued | Running | Failed | Skipped | Cancelled) => true,
            // running -> running records another attempt
            (Running, Running | Succeeded | Failed | Cancelled | Queued) => true,
            (Cancelled, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Workspace could not be acquired
    Provisioning,
    /// Running the task failed for reasons outside the task's own work
    Infrastructure,
    /// The task's own work did not succeed
    Logic,
    /// A circuit breaker refused the call
    BreakerOpen,
    /// The batch was cancelled
    Cancelled,
    /// A predecessor did not succeed
    Dependency,
}

impl FailureKind {
    /// Returns the string representation of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Infrastructure => "infrastructure",
            Self::Logic => "logic",
            Self::BreakerOpen => "breaker-open",
            Self::Cancelled => "cancelled",
            Self::Dependency => "dependency",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kind plus a short cause string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub cause: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.cause)
    }
}

/// Normalize a declared path for overlap checks.
///
/// Separators are unified, `.` segments dropped and `..` resolved lexically.
/// Leading slashes are ignored, so `/src` and `src` name the same tree. The
/// empty string denotes the root. Returns `None` for empty input or a path
/// that climbs above the root.
pub fn normalize_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let unified = raw.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    Some(parts.join("/"))
}

/// Whether normalized `dir` contains normalized `path` (or equals it)
pub fn path_contains(dir: &str, path: &str) -> bool {
    dir.is_empty()
        || path == dir
        || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/')
}
