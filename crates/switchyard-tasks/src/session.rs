//! Explicit per-batch context
//!
//! Everything that belongs to one running batch lives in a [`BatchSession`]
//! that is passed to the engine, so several batches can run side by side in
//! one process.

use std::collections::{BTreeMap, HashMap};

use tokio_util::sync::CancellationToken;
use tracing::info;

use switchyard_core::AnalysisError;

use crate::batch::Batch;
use crate::checkpoint::{Checkpoint, TaskRecord};
use crate::dag::ExecutionPlan;
use crate::task::{Task, TaskId};

/// One batch being run or resumed
#[derive(Debug, Clone)]
pub struct BatchSession {
    batch_id: String,
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    plan: ExecutionPlan,
    start_layer: usize,
    prior: BTreeMap<TaskId, TaskRecord>,
    resumed: bool,
    cancel: CancellationToken,
}

impl BatchSession {
    /// Analyze a fresh batch. Fails without running anything when the
    /// batch cannot be planned.
    pub fn new(batch: Batch) -> Result<Self, AnalysisError> {
        let plan = ExecutionPlan::analyze(&batch.tasks)?;
        info!(
            batch = %batch.id,
            tasks = batch.tasks.len(),
            layers = plan.layers().len(),
            "batch planned"
        );
        Ok(Self::assemble(batch.id, batch.tasks, plan, 0, BTreeMap::new(), false))
    }

    /// Continue a batch from its checkpoint: completed layers are trusted,
    /// the first incomplete layer is where execution restarts.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self::assemble(
            checkpoint.batch_id.clone(),
            checkpoint.tasks.clone(),
            checkpoint.plan.clone(),
            checkpoint.completed_layers,
            checkpoint.records.clone(),
            true,
        )
    }

    fn assemble(
        batch_id: String,
        tasks: Vec<Task>,
        plan: ExecutionPlan,
        start_layer: usize,
        prior: BTreeMap<TaskId, TaskRecord>,
        resumed: bool,
    ) -> Self {
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Self {
            batch_id,
            tasks,
            index,
            plan,
            start_layer,
            prior,
            resumed,
            cancel: CancellationToken::new(),
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Tasks in submission order
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// First layer that still has to run
    pub fn start_layer(&self) -> usize {
        self.start_layer
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Status a task had when the session was loaded
    pub fn prior(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.prior.get(id)
    }

    /// Namespaces left behind by tasks that have to run again
    pub fn abandoned_namespaces(&self) -> impl Iterator<Item = &str> {
        self.prior
            .values()
            .filter(|r| r.status.needs_rerun())
            .filter_map(|r| r.namespace.as_deref())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the batch: running tasks are cancelled, no new layer starts
    pub fn cancel(&self) {
        info!(batch = %self.batch_id, "batch cancellation requested");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointEvent;
    use crate::task::TaskStatus;
    use chrono::Utc;

    #[test]
    fn test_plan_fresh_batch() {
        let batch = Batch::new(
            "b1",
            vec![
                Task::new("A").with_file("x"),
                Task::new("B").with_file("y"),
                Task::new("C").with_file("x"),
            ],
        )
        .unwrap();
        let session = BatchSession::new(batch).unwrap();
        assert_eq!(session.batch_id(), "b1");
        assert_eq!(session.plan().layers().len(), 2);
        assert_eq!(session.start_layer(), 0);
        assert!(!session.is_resumed());
        assert!(session.task(&"C".into()).is_some());
        assert!(session.task(&"Z".into()).is_none());
    }

    #[test]
    fn test_cyclic_batch_is_rejected() {
        let batch = Batch::new(
            "b1",
            vec![Task::new("A").after("B"), Task::new("B").after("A")],
        )
        .unwrap();
        let err = BatchSession::new(batch).unwrap_err();
        assert_eq!(
            err,
            AnalysisError::CyclicDependency(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn test_from_checkpoint() {
        let tasks = vec![Task::new("A"), Task::new("B").after("A")];
        let plan = ExecutionPlan::analyze(&tasks).unwrap();
        let mut cp = Checkpoint::new("b1");
        let now = Utc::now();
        cp.apply(&CheckpointEvent::BatchPlanned { tasks, plan }, now)
            .unwrap();
        cp.apply(&CheckpointEvent::transition("A", TaskStatus::Running), now)
            .unwrap();
        cp.apply(&CheckpointEvent::transition("A", TaskStatus::Succeeded), now)
            .unwrap();
        cp.apply(&CheckpointEvent::LayerCompleted { index: 0 }, now)
            .unwrap();
        cp.apply(
            &CheckpointEvent::TaskTransition {
                id: "B".into(),
                status: TaskStatus::Running,
                attempts: 1,
                failure: None,
                namespace: Some("b1--B".to_string()),
            },
            now,
        )
        .unwrap();

        let session = BatchSession::from_checkpoint(&cp);
        assert!(session.is_resumed());
        assert_eq!(session.start_layer(), 1);
        assert_eq!(
            session.prior(&"A".into()).unwrap().status,
            TaskStatus::Succeeded
        );
        let abandoned: Vec<&str> = session.abandoned_namespaces().collect();
        assert_eq!(abandoned, vec!["b1--B"]);
    }

    #[test]
    fn test_cancel() {
        let batch = Batch::new("b1", vec![Task::new("A")]).unwrap();
        let session = BatchSession::new(batch).unwrap();
        let token = session.cancellation_token();
        assert!(!token.is_cancelled());
        session.cancel();
        assert!(token.is_cancelled());
        assert!(session.is_cancelled());
    }
}
