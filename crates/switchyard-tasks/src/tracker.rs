//! Best-effort status records for an external ticket tracker

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::reporter::{TaskEvent, TaskReporter};
use crate::resilience::CircuitBreaker;
use crate::task::{TaskId, TaskStatus};

/// Human-visible status of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub task_id: TaskId,
    pub batch_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

/// Receiver of status records
pub trait StatusSink: Send + Sync {
    fn send(&self, record: &StatusRecord) -> std::io::Result<()>;
}

/// Appends records as JSON lines to an outbox file
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusSink for JsonLinesSink {
    fn send(&self, record: &StatusRecord) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

/// Forwards terminal task events to a [`StatusSink`]. Sink failures are
/// logged and otherwise ignored; with a breaker attached, records are dropped
/// while the breaker is open.
pub struct TrackerReporter {
    sink: Arc<dyn StatusSink>,
    batch_id: String,
    started: Mutex<HashMap<TaskId, DateTime<Utc>>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl TrackerReporter {
    pub fn new(sink: Arc<dyn StatusSink>, batch_id: impl Into<String>) -> Self {
        Self {
            sink,
            batch_id: batch_id.into(),
            started: Mutex::new(HashMap::new()),
            breaker: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    fn emit(&self, id: &TaskId, status: TaskStatus, error_summary: Option<String>) {
        let started_at = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let record = StatusRecord {
            task_id: id.clone(),
            batch_id: self.batch_id.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
            error_summary,
        };

        if let Some(breaker) = &self.breaker {
            if !breaker.try_acquire() {
                debug!(task = %id, "tracker breaker open, dropping status record");
                return;
            }
        }
        match self.sink.send(&record) {
            Ok(()) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success();
                }
                debug!(task = %id, status = %status, "status record sent");
            }
            Err(e) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure();
                }
                warn!(task = %id, error = %e, "failed to send status record");
            }
        }
    }
}

impl TaskReporter for TrackerReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started { id, .. } => {
                self.started
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.clone(), Utc::now());
            }
            TaskEvent::Completed { id, .. } => self.emit(id, TaskStatus::Succeeded, None),
            TaskEvent::Failed { id, failure, .. } => {
                self.emit(id, TaskStatus::Failed, Some(failure.to_string()))
            }
            TaskEvent::Skipped { id, reason } => {
                self.emit(id, TaskStatus::Skipped, Some(reason.clone()))
            }
            TaskEvent::Cancelled { id } => self.emit(id, TaskStatus::Cancelled, None),
            _ => {}
        }
    }
}
