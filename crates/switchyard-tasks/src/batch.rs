//! Batch documents

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use switchyard_core::{AnalysisError, Result};

use crate::task::{Task, TaskId};
use crate::workspace::namespace_for;

/// On-disk batch document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchFile {
    /// Batch id; generated from the file name when absent
    #[serde(default)]
    pub id: Option<String>,

    /// Tasks in submission order
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// A submitted batch
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: String,
    pub tasks: Vec<Task>,
    /// File the batch was read from
    pub source: Option<PathBuf>,
}

impl Batch {
    pub fn new(id: impl Into<String>, tasks: Vec<Task>) -> Result<Self> {
        let id = id.into();
        validate_batch_id(&id)?;
        if tasks.is_empty() {
            return Err(AnalysisError::InvalidBatch("batch has no tasks".to_string()).into());
        }
        validate_namespaces(&id, &tasks)?;
        Ok(Self {
            id,
            tasks,
            source: None,
        })
    }

    /// Load a batch from a YAML or JSON file
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading batch");
        let content = std::fs::read_to_string(path)?;

        let file: BatchFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        let id = match file.id {
            Some(id) => id,
            None => {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("batch");
                generate_batch_id(stem, Utc::now())
            }
        };

        let mut batch = Self::new(id, file.tasks)?;
        batch.source = Some(path.to_path_buf());
        info!(batch = %batch.id, tasks = batch.tasks.len(), "loaded batch");
        Ok(batch)
    }
}

/// `<stem>-<YYYYmmddHHMMSS>`, with the stem reduced to id-safe characters
pub fn generate_batch_id(stem: &str, now: DateTime<Utc>) -> String {
    let stem: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}", stem, now.format("%Y%m%d%H%M%S"))
}

/// Batch ids name files in the state directory
fn validate_batch_id(id: &str) -> Result<()> {
    let ok = !id.trim().is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(AnalysisError::InvalidBatch(format!(
            "batch id '{}' may only contain letters, digits, '.', '_' and '-'",
            id
        ))
        .into())
    }
}

/// Distinct tasks must not share a workspace namespace
fn validate_namespaces(batch_id: &str, tasks: &[Task]) -> Result<()> {
    let mut seen: HashMap<String, &TaskId> = HashMap::new();
    for task in tasks {
        let namespace = namespace_for(batch_id, &task.id);
        match seen.get(&namespace) {
            Some(other) if **other != task.id => {
                return Err(AnalysisError::InvalidBatch(format!(
                    "tasks '{}' and '{}' map to the same workspace namespace '{}'",
                    other, task.id, namespace
                ))
                .into());
            }
            Some(_) => {}
            None => {
                seen.insert(namespace, &task.id);
            }
        }
    }
    Ok(())
}
