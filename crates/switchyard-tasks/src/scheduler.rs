//! Execution engine: runs a planned batch layer by layer using tokio

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchyard_core::config::ExecutionConfig;
use switchyard_core::{InfrastructureError, ProvisioningError, StateError};

use crate::checkpoint::{BatchState, CheckpointEvent, CheckpointWriter, TaskRecord};
use crate::reporter::{TaskEvent, TaskReporter};
use crate::resilience::{Resilience, ResilienceError};
use crate::runner::{RunContext, TaskOutcome, TaskRunner};
use crate::session::BatchSession;
use crate::task::{FailureKind, Task, TaskFailure, TaskId, TaskStatus};
use crate::workspace::{Provisioner, Workspace};

/// Final state of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub id: TaskId,
    /// Layer the task belongs to
    pub layer: usize,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Carried over from an earlier run of the batch
    pub resumed: bool,
}

impl TaskResult {
    fn from_record(id: &TaskId, layer: usize, record: &TaskRecord) -> Self {
        Self {
            id: id.clone(),
            layer,
            status: record.status,
            attempts: record.attempts,
            failure: record.failure.clone(),
            duration: record.elapsed().unwrap_or_default(),
            namespace: record.namespace.clone(),
            resumed: true,
        }
    }
}

/// Outcome of a whole batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub state: BatchState,
    /// Every task of the batch, in plan order
    pub results: Vec<TaskResult>,
    pub duration: Duration,
}

impl BatchReport {
    pub fn get(&self, id: &TaskId) -> Option<&TaskResult> {
        self.results.iter().find(|r| &r.id == id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.status.is_success())
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == BatchState::Cancelled
    }

    /// 0 when every task succeeded, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Options for the execution engine
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrently running tasks
    pub concurrency: usize,
    /// Limit for a single attempt
    pub task_timeout: Option<Duration>,
    /// Skip tasks whose predecessor did not succeed
    pub skip_dependents_of_failed: bool,
}

impl SchedulerOptions {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            task_timeout: config.task_timeout_secs.map(Duration::from_secs),
            skip_dependents_of_failed: config.skip_dependents_of_failed,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

/// How the run of one task ended
struct Verdict {
    status: TaskStatus,
    attempts: u32,
    failure: Option<TaskFailure>,
}

impl Verdict {
    fn new(status: TaskStatus, attempts: u32, failure: Option<TaskFailure>) -> Self {
        Self {
            status,
            attempts,
            failure,
        }
    }

    fn cancelled(attempts: u32) -> Self {
        Self::new(
            TaskStatus::Cancelled,
            attempts,
            Some(TaskFailure::new(FailureKind::Cancelled, "batch cancelled")),
        )
    }
}

/// Runs a planned batch: layers in order, tasks of a layer concurrently
#[derive(Clone)]
pub struct Orchestrator {
    options: SchedulerOptions,
    runner: Arc<dyn TaskRunner>,
    provisioner: Arc<Provisioner>,
    resilience: Resilience,
    reporter: Arc<dyn TaskReporter>,
}

impl Orchestrator {
    /// `resilience` guards calls into the runner; the provisioner carries
    /// its own.
    pub fn new(
        options: SchedulerOptions,
        runner: Arc<dyn TaskRunner>,
        provisioner: Arc<Provisioner>,
        resilience: Resilience,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            options,
            runner,
            provisioner,
            resilience,
            reporter,
        }
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Run every remaining layer of the session.
    ///
    /// Only checkpoint failures are returned as errors; task failures of any
    /// kind end up in the report.
    pub async fn run(
        &self,
        session: &BatchSession,
        checkpoint: &CheckpointWriter,
    ) -> Result<BatchReport, StateError> {
        let start = Instant::now();
        let plan = session.plan();
        let batch_id = session.batch_id();

        self.reporter.report(&TaskEvent::BatchStarted {
            batch_id: batch_id.to_string(),
            tasks: plan.len(),
            layers: plan.layers().len(),
            resumed: session.is_resumed(),
        });

        for namespace in session.abandoned_namespaces() {
            self.provisioner.mark_abandoned(namespace);
        }

        let mut results: HashMap<TaskId, TaskResult> = HashMap::new();
        for (idx, layer) in plan.layers().iter().enumerate() {
            for id in layer {
                let Some(record) = session.prior(id) else {
                    continue;
                };
                if record.status.needs_rerun() {
                    if record.status != TaskStatus::Queued {
                        checkpoint
                            .record(CheckpointEvent::transition(id.clone(), TaskStatus::Queued))
                            .await?;
                    }
                } else {
                    debug!(task = %id, status = %record.status, "keeping result from earlier run");
                    results.insert(id.clone(), TaskResult::from_record(id, idx, record));
                }
            }
        }

        let mut cancelled = false;
        for (idx, layer) in plan.layers().iter().enumerate().skip(session.start_layer()) {
            let pending: Vec<&TaskId> = layer
                .iter()
                .filter(|id| !results.contains_key(*id))
                .collect();

            if cancelled || session.is_cancelled() {
                cancelled = true;
                for id in pending {
                    let result = self
                        .finish(checkpoint, id, idx, Verdict::cancelled(0), None, Duration::ZERO)
                        .await?;
                    results.insert(id.clone(), result);
                }
                continue;
            }

            self.reporter.report(&TaskEvent::LayerStarted {
                layer: idx,
                task_count: layer.len(),
            });
            info!(batch = %batch_id, layer = idx, tasks = pending.len(), "starting layer");

            let mut runnable = Vec::new();
            for id in pending {
                let blocker = plan
                    .predecessors(id)
                    .find(|p| results.get(*p).map_or(false, |r| !r.status.is_success()));
                match blocker {
                    Some(blocker) if self.options.skip_dependents_of_failed => {
                        let failure = TaskFailure::new(
                            FailureKind::Dependency,
                            format!("predecessor '{}' did not succeed", blocker),
                        );
                        let verdict = Verdict::new(TaskStatus::Skipped, 0, Some(failure));
                        let result = self
                            .finish(checkpoint, id, idx, verdict, None, Duration::ZERO)
                            .await?;
                        results.insert(id.clone(), result);
                    }
                    _ => runnable.push(id.clone()),
                }
            }

            for result in self.run_layer(session, checkpoint, idx, &runnable).await? {
                results.insert(result.id.clone(), result);
            }

            let finished = &results;
            let layer_results = move || layer.iter().filter_map(move |id| finished.get(id));
            if layer_results().any(|r| r.status == TaskStatus::Cancelled) {
                cancelled = true;
                continue;
            }

            checkpoint
                .record(CheckpointEvent::LayerCompleted { index: idx })
                .await?;
            self.reporter.report(&TaskEvent::LayerCompleted {
                layer: idx,
                succeeded: layer_results().filter(|r| r.status.is_success()).count(),
                failed: layer_results()
                    .filter(|r| r.status == TaskStatus::Failed)
                    .count(),
            });
        }

        let ordered: Vec<TaskResult> = plan
            .layers()
            .iter()
            .flatten()
            .filter_map(|id| results.remove(id))
            .collect();

        let state = if cancelled {
            BatchState::Cancelled
        } else if ordered.iter().all(|r| r.status.is_success()) {
            BatchState::Succeeded
        } else {
            BatchState::Failed
        };
        checkpoint
            .record(CheckpointEvent::BatchFinished { state })
            .await?;

        let report = BatchReport {
            batch_id: batch_id.to_string(),
            state,
            results: ordered,
            duration: start.elapsed(),
        };

        self.reporter.report(&TaskEvent::BatchCompleted {
            batch_id: report.batch_id.clone(),
            total: report.results.len(),
            succeeded: report.count(TaskStatus::Succeeded),
            failed: report.count(TaskStatus::Failed),
            skipped: report.count(TaskStatus::Skipped),
            cancelled: report.count(TaskStatus::Cancelled),
            duration: report.duration,
        });

        Ok(report)
    }

    /// Run one layer's tasks concurrently, bounded by the worker pool.
    ///
    /// Tasks are started in the given order as permits free up; returns once
    /// every task is terminal and checkpointed.
    pub async fn run_layer(
        &self,
        session: &BatchSession,
        checkpoint: &CheckpointWriter,
        layer: usize,
        ids: &[TaskId],
    ) -> Result<Vec<TaskResult>, StateError> {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let cancel = session.cancellation_token();
        let mut handles = Vec::new();

        for id in ids {
            let Some(task) = session.task(id).cloned() else {
                warn!(task = %id, "task missing from session, ignoring");
                continue;
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };

            let this = self.clone();
            let checkpoint = checkpoint.clone();
            let batch_id = session.batch_id().to_string();
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                match permit {
                    Some(permit) => {
                        let result = this
                            .execute_task(&batch_id, &task, layer, &checkpoint, &cancel)
                            .await;
                        drop(permit);
                        result
                    }
                    None => {
                        this.finish(&checkpoint, &task.id, layer, Verdict::cancelled(0), None, Duration::ZERO)
                            .await
                    }
                }
            });
            handles.push((id.clone(), handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;

        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    error!(task = %id, error = %e, "checkpoint write failed");
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    error!(task = %id, error = %join_error, "task worker died");
                    let failure = TaskFailure::new(
                        FailureKind::Infrastructure,
                        format!("worker died: {}", join_error),
                    );
                    match self
                        .finish(
                            checkpoint,
                            &id,
                            layer,
                            Verdict::new(TaskStatus::Failed, 0, Some(failure)),
                            None,
                            Duration::ZERO,
                        )
                        .await
                    {
                        Ok(result) => results.push(result),
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Acquire, run, release, record
    async fn execute_task(
        &self,
        batch_id: &str,
        task: &Task,
        layer: usize,
        checkpoint: &CheckpointWriter,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, StateError> {
        let start = Instant::now();

        if cancel.is_cancelled() {
            return self
                .finish(checkpoint, &task.id, layer, Verdict::cancelled(0), None, Duration::ZERO)
                .await;
        }

        let workspace = match self.provisioner.acquire(batch_id, &task.id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                let kind = match e {
                    ProvisioningError::BreakerOpen { .. } => FailureKind::BreakerOpen,
                    _ => FailureKind::Provisioning,
                };
                let verdict = Verdict::new(
                    TaskStatus::Failed,
                    0,
                    Some(TaskFailure::new(kind, e.to_string())),
                );
                return self
                    .finish(checkpoint, &task.id, layer, verdict, None, start.elapsed())
                    .await;
            }
        };
        let namespace = workspace.namespace().to_string();

        let running = checkpoint
            .record(CheckpointEvent::TaskTransition {
                id: task.id.clone(),
                status: TaskStatus::Running,
                attempts: 1,
                failure: None,
                namespace: Some(namespace.clone()),
            })
            .await;
        if let Err(e) = running {
            self.provisioner.release(workspace, TaskStatus::Failed).await;
            return Err(e);
        }

        self.reporter.report(&TaskEvent::Started {
            id: task.id.clone(),
            command: task.command.clone(),
            namespace: namespace.clone(),
        });

        let tried = AtomicU32::new(0);
        let verdict = tokio::select! {
            _ = cancel.cancelled() => Verdict::cancelled(tried.load(Ordering::SeqCst)),
            verdict = self.run_with_retries(batch_id, task, &workspace, &tried) => verdict,
        };

        self.provisioner.release(workspace, verdict.status).await;

        self.finish(checkpoint, &task.id, layer, verdict, Some(namespace), start.elapsed())
            .await
    }

    async fn run_with_retries(
        &self,
        batch_id: &str,
        task: &Task,
        workspace: &Workspace,
        tried: &AtomicU32,
    ) -> Verdict {
        let this = self;
        let reporter = self.reporter.as_ref();

        let result = self
            .resilience
            .call(
                move |attempt| {
                    tried.store(attempt, Ordering::SeqCst);
                    async move { this.attempt(batch_id, task, workspace, attempt).await }
                },
                |attempt, err, delay| {
                    reporter.report(&TaskEvent::Retrying {
                        id: task.id.clone(),
                        attempt,
                        delay,
                        error: err.to_string(),
                    })
                },
            )
            .await;

        let attempts = tried.load(Ordering::SeqCst);
        match result {
            Ok(done) => match done.value {
                TaskOutcome::Succeeded => Verdict::new(TaskStatus::Succeeded, done.attempts, None),
                TaskOutcome::Failed { cause } => Verdict::new(
                    TaskStatus::Failed,
                    done.attempts,
                    Some(TaskFailure::new(FailureKind::Logic, cause)),
                ),
            },
            Err(e @ ResilienceError::BreakerOpen { .. }) => Verdict::new(
                TaskStatus::Failed,
                attempts,
                Some(TaskFailure::new(FailureKind::BreakerOpen, e.to_string())),
            ),
            Err(e) => Verdict::new(
                TaskStatus::Failed,
                attempts,
                Some(TaskFailure::new(FailureKind::Infrastructure, e.to_string())),
            ),
        }
    }

    /// One attempt: timeout applied, panics contained
    async fn attempt(
        &self,
        batch_id: &str,
        task: &Task,
        workspace: &Workspace,
        attempt: u32,
    ) -> Result<TaskOutcome, InfrastructureError> {
        let ctx = RunContext {
            batch_id,
            task,
            workspace,
            attempt,
            reporter: self.reporter.as_ref(),
        };

        let guarded = AssertUnwindSafe(self.runner.run(ctx))
            .catch_unwind()
            .map(|caught| {
                caught.unwrap_or_else(|panic| {
                    Err(InfrastructureError::Panicked(panic_message(panic.as_ref())))
                })
            });

        match self.options.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(result) => result,
                Err(_) => Err(InfrastructureError::Timeout {
                    secs: limit.as_secs(),
                }),
            },
            None => guarded.await,
        }
    }

    /// Record a terminal status and report it
    async fn finish(
        &self,
        checkpoint: &CheckpointWriter,
        id: &TaskId,
        layer: usize,
        verdict: Verdict,
        namespace: Option<String>,
        duration: Duration,
    ) -> Result<TaskResult, StateError> {
        checkpoint
            .record(CheckpointEvent::TaskTransition {
                id: id.clone(),
                status: verdict.status,
                attempts: verdict.attempts,
                failure: verdict.failure.clone(),
                namespace: None,
            })
            .await?;

        let event = match (verdict.status, &verdict.failure) {
            (TaskStatus::Succeeded, _) => TaskEvent::Completed {
                id: id.clone(),
                duration,
                attempts: verdict.attempts,
            },
            (TaskStatus::Cancelled, _) => TaskEvent::Cancelled { id: id.clone() },
            (TaskStatus::Skipped, failure) => TaskEvent::Skipped {
                id: id.clone(),
                reason: failure
                    .as_ref()
                    .map(|f| f.cause.clone())
                    .unwrap_or_default(),
            },
            (_, failure) => TaskEvent::Failed {
                id: id.clone(),
                duration,
                failure: failure
                    .clone()
                    .unwrap_or_else(|| TaskFailure::new(FailureKind::Infrastructure, "unknown failure")),
            },
        };
        self.reporter.report(&event);

        Ok(TaskResult {
            id: id.clone(),
            layer,
            status: verdict.status,
            attempts: verdict.attempts,
            failure: verdict.failure,
            duration,
            namespace,
            resumed: false,
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
