//! Task execution reporting

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::task::{TaskFailure, TaskId};

/// Events emitted during batch execution
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A batch is starting (or resuming)
    BatchStarted {
        batch_id: String,
        tasks: usize,
        layers: usize,
        resumed: bool,
    },
    /// An execution layer is starting
    LayerStarted { layer: usize, task_count: usize },
    /// A task acquired its workspace and is running
    Started {
        id: TaskId,
        command: Option<String>,
        namespace: String,
    },
    /// A task produced output
    Output {
        id: TaskId,
        line: String,
        is_stderr: bool,
    },
    /// An attempt failed and will be retried
    Retrying {
        id: TaskId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// A task succeeded
    Completed {
        id: TaskId,
        duration: Duration,
        attempts: u32,
    },
    /// A task failed
    Failed {
        id: TaskId,
        duration: Duration,
        failure: TaskFailure,
    },
    /// A task was not run
    Skipped { id: TaskId, reason: String },
    /// A task was cancelled
    Cancelled { id: TaskId },
    /// Every task of a layer reached a terminal status
    LayerCompleted {
        layer: usize,
        succeeded: usize,
        failed: usize,
    },
    /// The batch finished
    BatchCompleted {
        batch_id: String,
        total: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: usize,
        duration: Duration,
    },
}

impl TaskEvent {
    /// Task the event is about, if any
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Started { id, .. }
            | Self::Output { id, .. }
            | Self::Retrying { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. }
            | Self::Skipped { id, .. }
            | Self::Cancelled { id } => Some(id),
            _ => None,
        }
    }
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::BatchStarted {
                batch_id,
                tasks,
                layers,
                resumed,
            } => {
                tracing::info!(batch = %batch_id, tasks, layers, resumed, "batch started");
            }
            TaskEvent::LayerStarted { layer, task_count } => {
                tracing::info!(layer, "Starting layer {} ({} tasks)", layer, task_count);
            }
            TaskEvent::Started {
                id,
                command,
                namespace,
            } => {
                tracing::info!(
                    task = %id,
                    namespace = %namespace,
                    "Starting {}: {}",
                    id,
                    command.as_deref().unwrap_or("<no command>")
                );
            }
            TaskEvent::Output { id, line, is_stderr } => {
                if *is_stderr {
                    tracing::warn!("[{}] {}", id, line);
                } else {
                    tracing::debug!("[{}] {}", id, line);
                }
            }
            TaskEvent::Retrying {
                id,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    task = %id,
                    attempt,
                    "attempt {} failed, retrying in {:.1}s: {}",
                    attempt,
                    delay.as_secs_f64(),
                    error
                );
            }
            TaskEvent::Completed {
                id,
                duration,
                attempts,
            } => {
                tracing::info!(
                    task = %id,
                    attempts,
                    "{} completed in {:.1}s",
                    id,
                    duration.as_secs_f64()
                );
            }
            TaskEvent::Failed {
                id,
                duration,
                failure,
            } => {
                tracing::error!(
                    task = %id,
                    kind = %failure.kind,
                    "{} failed after {:.1}s: {}",
                    id,
                    duration.as_secs_f64(),
                    failure.cause
                );
            }
            TaskEvent::Skipped { id, reason } => {
                tracing::info!(task = %id, "{} skipped: {}", id, reason);
            }
            TaskEvent::Cancelled { id } => {
                tracing::warn!(task = %id, "{} cancelled", id);
            }
            TaskEvent::LayerCompleted {
                layer,
                succeeded,
                failed,
            } => {
                tracing::info!(layer, succeeded, failed, "layer complete");
            }
            TaskEvent::BatchCompleted {
                batch_id,
                total,
                succeeded,
                failed,
                skipped,
                cancelled,
                duration,
            } => {
                tracing::info!(
                    batch = %batch_id,
                    "Batch complete: {}/{} succeeded, {} failed, {} skipped, {} cancelled ({:.1}s)",
                    succeeded,
                    total,
                    failed,
                    skipped,
                    cancelled,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events concerning one task, in arrival order
    pub fn events_for(&self, id: &TaskId) -> Vec<TaskEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.task_id() == Some(id))
            .collect()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Registry of task reporters
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        self.broadcast(event);
    }
}
