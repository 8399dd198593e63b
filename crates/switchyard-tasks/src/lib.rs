//! Switchyard Tasks - parallel task orchestration engine
//!
//! This crate turns a batch of tasks into conflict-free execution layers and
//! runs them in isolated workspaces, with retries, circuit breakers and a
//! durable checkpoint that allows interrupted batches to be resumed.

pub mod batch;
pub mod checkpoint;
pub mod conflict;
pub mod dag;
pub mod reporter;
pub mod resilience;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod tracker;
pub mod workspace;

pub use batch::{Batch, BatchFile};
pub use checkpoint::{
    BatchState, Checkpoint, CheckpointEvent, CheckpointStore, CheckpointWriter, TaskRecord,
};
pub use conflict::{detect, detect_all, ConflictEdge, ConflictKind, ConflictResult, EdgeOrdering};
pub use dag::ExecutionPlan;
pub use reporter::{CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter};
pub use resilience::{
    BreakerPermit, BreakerState, CircuitBreaker, Clock, ManualClock, Resilience, ResilienceError,
    RetryPolicy, TokioClock,
};
pub use runner::{CommandRunner, RunContext, TaskOutcome, TaskRunner};
pub use scheduler::{BatchReport, Orchestrator, SchedulerOptions, TaskResult};
pub use session::BatchSession;
pub use task::{
    FailureKind, ResourceFootprint, Task, TaskFailure, TaskId, TaskKind, TaskStatus,
};
pub use tracker::{JsonLinesSink, StatusRecord, StatusSink, TrackerReporter};
pub use workspace::{
    namespace_for, DirectoryBackend, Provisioner, Workspace, WorkspaceBackend, WorkspaceHandle,
};
