//! Durable batch progress
//!
//! Each batch gets two files in the state directory:
//!
//! - `<id>.checkpoint.json`: the full snapshot, replaced atomically
//! - `<id>.events.jsonl`: append-only journal of every recorded event
//!
//! All writes go through one [`CheckpointWriter`] actor. `record` returns
//! once the event is in the journal and the snapshot on disk reflects it.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use switchyard_core::StateError;

use crate::dag::ExecutionPlan;
use crate::task::{Task, TaskFailure, TaskId, TaskStatus};

/// Snapshot format version
pub const CHECKPOINT_VERSION: u32 = 1;

const WRITER_QUEUE: usize = 64;

/// Overall batch state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    #[default]
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// The batch ran to the end; nothing is left to resume
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status of one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    /// Workspace namespace, once one was acquired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Wall time between start and finish, when both are known
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Something that happened to a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CheckpointEvent {
    /// Analysis finished; every task is queued
    BatchPlanned { tasks: Vec<Task>, plan: ExecutionPlan },
    /// A task changed status
    TaskTransition {
        id: TaskId,
        status: TaskStatus,
        #[serde(default)]
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<TaskFailure>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
    /// Every task of the layer is terminal
    LayerCompleted { index: usize },
    /// The batch stopped
    BatchFinished { state: BatchState },
}

impl CheckpointEvent {
    /// A plain status change with no extra detail
    pub fn transition(id: impl Into<TaskId>, status: TaskStatus) -> Self {
        Self::TaskTransition {
            id: id.into(),
            status,
            attempts: 0,
            failure: None,
            namespace: None,
        }
    }
}

/// One journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    at: DateTime<Utc>,
    event: CheckpointEvent,
}

/// Snapshot of a batch's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_version")]
    pub version: u32,
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub state: BatchState,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub plan: ExecutionPlan,
    /// Layers `0..completed_layers` are done
    #[serde(default)]
    pub completed_layers: usize,
    #[serde(default)]
    pub records: BTreeMap<TaskId, TaskRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

impl Checkpoint {
    pub fn new(batch_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            batch_id: batch_id.into(),
            created_at: now,
            updated_at: now,
            state: BatchState::Running,
            tasks: Vec::new(),
            plan: ExecutionPlan::default(),
            completed_layers: 0,
            records: BTreeMap::new(),
            last_error: None,
        }
    }

    /// Fold one event into the snapshot
    pub fn apply(&mut self, event: &CheckpointEvent, at: DateTime<Utc>) -> Result<(), StateError> {
        match event {
            CheckpointEvent::BatchPlanned { tasks, plan } => {
                self.tasks = tasks.clone();
                self.plan = plan.clone();
                self.completed_layers = 0;
                self.records = tasks
                    .iter()
                    .map(|t| {
                        let record = TaskRecord {
                            status: TaskStatus::Queued,
                            ..TaskRecord::default()
                        };
                        (t.id.clone(), record)
                    })
                    .collect();
                self.state = BatchState::Running;
            }
            CheckpointEvent::TaskTransition {
                id,
                status,
                attempts,
                failure,
                namespace,
            } => {
                let record = self.records.get_mut(id).ok_or_else(|| {
                    StateError::InvalidTransition {
                        task: id.to_string(),
                        from: "unknown".to_string(),
                        to: status.to_string(),
                    }
                })?;

                if !record.status.can_transition_to(*status) {
                    return Err(StateError::InvalidTransition {
                        task: id.to_string(),
                        from: record.status.to_string(),
                        to: status.to_string(),
                    });
                }

                match status {
                    TaskStatus::Queued => {
                        record.failure = None;
                        record.started_at = None;
                        record.finished_at = None;
                    }
                    TaskStatus::Running if record.started_at.is_none() => {
                        record.started_at = Some(at);
                    }
                    s if s.is_terminal() => {
                        record.finished_at = Some(at);
                    }
                    _ => {}
                }

                record.status = *status;
                record.attempts = record.attempts.max(*attempts);
                if let Some(ns) = namespace {
                    record.namespace = Some(ns.clone());
                }
                if let Some(failure) = failure {
                    self.last_error = Some(format!("{}: {}", id, failure));
                    record.failure = Some(failure.clone());
                }
            }
            CheckpointEvent::LayerCompleted { index } => {
                self.completed_layers = self.completed_layers.max(index + 1);
            }
            CheckpointEvent::BatchFinished { state } => {
                self.state = *state;
            }
        }
        self.updated_at = at;
        Ok(())
    }

    /// Index of the first layer not yet completed
    pub fn current_layer(&self) -> Option<usize> {
        (self.completed_layers < self.plan.layers().len()).then_some(self.completed_layers)
    }

    /// Whether `resume` has anything to do
    pub fn is_resumable(&self) -> bool {
        !self.state.is_finished()
    }

    pub fn record(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.records.get(id)
    }

    /// Number of tasks currently in a status
    pub fn count(&self, status: TaskStatus) -> usize {
        self.records.values().filter(|r| r.status == status).count()
    }

    /// Rebuild a snapshot from journal lines
    fn replay(batch_id: &str, path: &Path) -> Result<Self, StateError> {
        let file = File::open(path)?;
        let mut checkpoint = Checkpoint::new(batch_id);
        let mut first = true;

        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    // a torn final line from a crash mid-append
                    warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable journal line");
                    continue;
                }
            };
            if first {
                checkpoint.created_at = entry.at;
                first = false;
            }
            checkpoint.apply(&entry.event, entry.at)?;
        }

        if first {
            return Err(StateError::Corrupt {
                path: path.to_path_buf(),
                reason: "journal is empty".to_string(),
            });
        }
        Ok(checkpoint)
    }
}

/// Checkpoints of all batches under one directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.json", batch_id))
    }

    pub fn journal_path(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("{}.events.jsonl", batch_id))
    }

    pub fn exists(&self, batch_id: &str) -> bool {
        self.snapshot_path(batch_id).exists() || self.journal_path(batch_id).exists()
    }

    /// Latest durable state of a batch.
    ///
    /// Falls back to replaying the journal when the snapshot is missing or
    /// unreadable.
    pub fn load_latest(&self, batch_id: &str) -> Result<Checkpoint, StateError> {
        let snapshot = self.snapshot_path(batch_id);
        let journal = self.journal_path(batch_id);

        match fs::read_to_string(&snapshot) {
            Ok(content) => match serde_json::from_str::<Checkpoint>(&content) {
                Ok(checkpoint) => return Ok(checkpoint),
                Err(e) if journal.exists() => {
                    warn!(path = %snapshot.display(), error = %e, "unreadable snapshot, replaying journal");
                }
                Err(e) => {
                    return Err(StateError::Corrupt {
                        path: snapshot,
                        reason: e.to_string(),
                    })
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !journal.exists() {
                    return Err(StateError::NotFound(batch_id.to_string()));
                }
                debug!(batch = %batch_id, "no snapshot, replaying journal");
            }
            Err(e) => return Err(e.into()),
        }

        Checkpoint::replay(batch_id, &journal)
    }

    /// Whether a batch has a checkpoint that can be resumed
    pub fn resumable(&self, batch_id: &str) -> Result<bool, StateError> {
        match self.load_latest(batch_id) {
            Ok(checkpoint) => Ok(checkpoint.is_resumable()),
            Err(StateError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// All readable checkpoints, oldest first
    pub fn list(&self) -> Result<Vec<Checkpoint>, StateError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(batch_id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".checkpoint.json"))
            else {
                continue;
            };
            match self.load_latest(batch_id) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(batch = %batch_id, error = %e, "skipping unreadable checkpoint"),
            }
        }

        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(checkpoints)
    }

    /// Start recording a new batch
    pub async fn create(
        &self,
        batch_id: &str,
        tasks: &[Task],
        plan: &ExecutionPlan,
    ) -> Result<CheckpointWriter, StateError> {
        if self.exists(batch_id) {
            return Err(StateError::AlreadyExists(batch_id.to_string()));
        }
        fs::create_dir_all(&self.dir)?;

        let writer = self.open(Checkpoint::new(batch_id));
        writer
            .record(CheckpointEvent::BatchPlanned {
                tasks: tasks.to_vec(),
                plan: plan.clone(),
            })
            .await?;
        Ok(writer)
    }

    /// Spawn the writer for an existing (or freshly created) checkpoint
    pub fn open(&self, checkpoint: Checkpoint) -> CheckpointWriter {
        let paths = BatchPaths {
            dir: self.dir.clone(),
            snapshot: self.snapshot_path(&checkpoint.batch_id),
            journal: self.journal_path(&checkpoint.batch_id),
        };
        let (tx, rx) = mpsc::channel(WRITER_QUEUE);
        tokio::task::spawn_blocking(move || writer_loop(checkpoint, paths, rx));
        CheckpointWriter { tx }
    }
}

struct BatchPaths {
    dir: PathBuf,
    snapshot: PathBuf,
    journal: PathBuf,
}

enum WriterCommand {
    Record {
        event: CheckpointEvent,
        ack: oneshot::Sender<Result<(), StateError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Checkpoint>,
    },
}

/// Handle to the single checkpoint writer of a batch. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    tx: mpsc::Sender<WriterCommand>,
}

impl CheckpointWriter {
    /// Record an event; returns once it is durable
    pub async fn record(&self, event: CheckpointEvent) -> Result<(), StateError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriterCommand::Record { event, ack })
            .await
            .map_err(|_| StateError::WriterClosed)?;
        done.await.map_err(|_| StateError::WriterClosed)?
    }

    /// Current in-memory snapshot
    pub async fn snapshot(&self) -> Result<Checkpoint, StateError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(WriterCommand::Snapshot { reply })
            .await
            .map_err(|_| StateError::WriterClosed)?;
        done.await.map_err(|_| StateError::WriterClosed)
    }
}

fn writer_loop(
    mut checkpoint: Checkpoint,
    paths: BatchPaths,
    mut rx: mpsc::Receiver<WriterCommand>,
) {
    debug!(batch = %checkpoint.batch_id, "checkpoint writer started");
    while let Some(command) = rx.blocking_recv() {
        match command {
            WriterCommand::Record { event, ack } => {
                let result = persist(&mut checkpoint, &paths, event);
                if let Err(e) = &result {
                    warn!(batch = %checkpoint.batch_id, error = %e, "checkpoint write rejected");
                }
                let _ = ack.send(result);
            }
            WriterCommand::Snapshot { reply } => {
                let _ = reply.send(checkpoint.clone());
            }
        }
    }
    debug!(batch = %checkpoint.batch_id, "checkpoint writer stopped");
}

/// Journal, then snapshot, then adopt. A rejected event changes nothing.
fn persist(
    checkpoint: &mut Checkpoint,
    paths: &BatchPaths,
    event: CheckpointEvent,
) -> Result<(), StateError> {
    let at = Utc::now();
    let mut next = checkpoint.clone();
    next.apply(&event, at)?;

    append_journal(&paths.journal, &JournalEntry { at, event })?;
    write_snapshot(&paths.dir, &paths.snapshot, &next)?;

    *checkpoint = next;
    Ok(())
}

fn append_journal(path: &Path, entry: &JournalEntry) -> Result<(), StateError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{}", line)?;
    file.sync_data()?;
    Ok(())
}

fn write_snapshot(dir: &Path, path: &Path, checkpoint: &Checkpoint) -> Result<(), StateError> {
    // Atomic write: temp file in the same directory, fsync, then rename
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, checkpoint)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    #[cfg(unix)]
    File::open(dir)?.sync_all()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FailureKind;
    use tempfile::TempDir;

    fn batch() -> (Vec<Task>, ExecutionPlan) {
        let tasks = vec![
            Task::new("A").with_file("x"),
            Task::new("B").with_file("y"),
            Task::new("C").with_file("x"),
        ];
        let plan = ExecutionPlan::analyze(&tasks).unwrap();
        (tasks, plan)
    }

    fn planned() -> Checkpoint {
        let (tasks, plan) = batch();
        let mut cp = Checkpoint::new("b1");
        cp.apply(&CheckpointEvent::BatchPlanned { tasks, plan }, Utc::now())
            .unwrap();
        cp
    }

    #[test]
    fn test_planned_tasks_are_queued() {
        let cp = planned();
        assert_eq!(cp.count(TaskStatus::Queued), 3);
        assert_eq!(cp.current_layer(), Some(0));
        assert!(cp.is_resumable());
    }

    #[test]
    fn test_apply_transitions() {
        let mut cp = planned();
        let now = Utc::now();

        cp.apply(
            &CheckpointEvent::TaskTransition {
                id: "A".into(),
                status: TaskStatus::Running,
                attempts: 1,
                failure: None,
                namespace: Some("b1--A".to_string()),
            },
            now,
        )
        .unwrap();
        cp.apply(
            &CheckpointEvent::TaskTransition {
                id: "A".into(),
                status: TaskStatus::Failed,
                attempts: 2,
                failure: Some(TaskFailure::new(FailureKind::Logic, "exit code 1")),
                namespace: None,
            },
            now,
        )
        .unwrap();

        let record = cp.record(&"A".into()).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.namespace.as_deref(), Some("b1--A"));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
        assert_eq!(cp.last_error.as_deref(), Some("A: logic: exit code 1"));
    }

    #[test]
    fn test_cancelled_task_is_finished_until_requeued() {
        let mut cp = planned();
        let now = Utc::now();
        cp.apply(&CheckpointEvent::transition("A", TaskStatus::Running), now)
            .unwrap();
        cp.apply(&CheckpointEvent::transition("A", TaskStatus::Cancelled), now)
            .unwrap();
        assert_eq!(cp.record(&"A".into()).unwrap().finished_at, Some(now));

        cp.apply(&CheckpointEvent::transition("A", TaskStatus::Queued), now)
            .unwrap();
        let record = cp.record(&"A".into()).unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut cp = planned();
        let err = cp
            .apply(
                &CheckpointEvent::transition("A", TaskStatus::Succeeded),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));

        let err = cp
            .apply(
                &CheckpointEvent::transition("nope", TaskStatus::Running),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn test_layers_and_finish() {
        let mut cp = planned();
        cp.apply(&CheckpointEvent::LayerCompleted { index: 0 }, Utc::now())
            .unwrap();
        assert_eq!(cp.current_layer(), Some(1));
        cp.apply(&CheckpointEvent::LayerCompleted { index: 1 }, Utc::now())
            .unwrap();
        assert_eq!(cp.current_layer(), None);

        cp.apply(
            &CheckpointEvent::BatchFinished {
                state: BatchState::Succeeded,
            },
            Utc::now(),
        )
        .unwrap();
        assert!(!cp.is_resumable());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let json = r#"{
            "version": 1,
            "batch_id": "b9",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "some_future_field": {"nested": true},
            "records": {
                "A": {"status": "running", "attempts": 1, "owner": "someone"}
            }
        }"#;
        let cp: Checkpoint = serde_json::from_str(json).unwrap();
        assert_eq!(cp.batch_id, "b9");
        assert_eq!(cp.state, BatchState::Running);
        assert_eq!(cp.record(&"A".into()).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_create_record_and_load() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().join("state"));
        let (tasks, plan) = batch();

        let writer = store.create("b1", &tasks, &plan).await.unwrap();
        writer
            .record(CheckpointEvent::transition("A", TaskStatus::Running))
            .await
            .unwrap();

        // durable as soon as record returns
        let loaded = store.load_latest("b1").unwrap();
        assert_eq!(loaded.record(&"A".into()).unwrap().status, TaskStatus::Running);
        assert_eq!(loaded.tasks.len(), 3);
        assert_eq!(loaded.plan, plan);
        assert_eq!(loaded, writer.snapshot().await.unwrap());

        let journal = fs::read_to_string(store.journal_path("b1")).unwrap();
        assert_eq!(journal.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let (tasks, plan) = batch();

        let _writer = store.create("b1", &tasks, &plan).await.unwrap();
        let err = store.create("b1", &tasks, &plan).await.unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_rejected_event_is_not_persisted() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let (tasks, plan) = batch();
        let writer = store.create("b1", &tasks, &plan).await.unwrap();

        let err = writer
            .record(CheckpointEvent::transition("B", TaskStatus::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));

        let loaded = store.load_latest("b1").unwrap();
        assert_eq!(loaded.record(&"B".into()).unwrap().status, TaskStatus::Queued);
        let journal = fs::read_to_string(store.journal_path("b1")).unwrap();
        assert_eq!(journal.lines().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_are_serialized() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let tasks: Vec<Task> = (0..20).map(|i| Task::new(format!("t{}", i))).collect();
        let plan = ExecutionPlan::analyze(&tasks).unwrap();
        let writer = store.create("wide", &tasks, &plan).await.unwrap();

        let mut handles = Vec::new();
        for task in &tasks {
            let writer = writer.clone();
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                writer
                    .record(CheckpointEvent::transition(id.clone(), TaskStatus::Running))
                    .await
                    .unwrap();
                writer
                    .record(CheckpointEvent::transition(id, TaskStatus::Succeeded))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let loaded = store.load_latest("wide").unwrap();
        assert_eq!(loaded.count(TaskStatus::Succeeded), 20);
        let journal = fs::read_to_string(store.journal_path("wide")).unwrap();
        assert_eq!(journal.lines().count(), 41);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_falls_back_to_journal() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let (tasks, plan) = batch();
        let writer = store.create("b1", &tasks, &plan).await.unwrap();
        writer
            .record(CheckpointEvent::transition("B", TaskStatus::Running))
            .await
            .unwrap();

        fs::write(store.snapshot_path("b1"), "{ not json").unwrap();
        // and a torn last journal line
        let mut journal = OpenOptions::new()
            .append(true)
            .open(store.journal_path("b1"))
            .unwrap();
        journal.write_all(b"{\"at\":\"2026-").unwrap();

        let loaded = store.load_latest("b1").unwrap();
        assert_eq!(loaded.record(&"B".into()).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_resumable_and_list() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let (tasks, plan) = batch();

        assert!(!store.resumable("missing").unwrap());
        assert!(matches!(
            store.load_latest("missing"),
            Err(StateError::NotFound(_))
        ));

        let running = store.create("b1", &tasks, &plan).await.unwrap();
        let done = store.create("b2", &tasks, &plan).await.unwrap();
        done.record(CheckpointEvent::BatchFinished {
            state: BatchState::Failed,
        })
        .await
        .unwrap();
        drop(running);

        assert!(store.resumable("b1").unwrap());
        assert!(!store.resumable("b2").unwrap());

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|c| c.batch_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"b1".to_string()));
        assert!(ids.contains(&"b2".to_string()));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
    }
}
