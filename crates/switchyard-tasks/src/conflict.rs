//! Pairwise conflict analysis between task footprints
//!
//! [`detect`] is a pure, total function: any pair it cannot reason about is
//! reported as conflicting so the planner serializes it.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::task::{normalize_path, path_contains, Task, TaskId};

/// Category of interference between two tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Both tasks declare the same file
    FileOverlap,
    /// Same directory, or one task's directory contains the other's path
    DirectoryOverlap,
    /// Both tasks use the same external service
    ServiceContention,
    /// Both tasks touch the same database/table or shared state
    ResourceContention,
    /// Caller-declared semantic overlap (shared feature tag or explicit relation)
    SemanticOverlap,
    /// The footprints could not be analysed; treated as a conflict
    Unanalyzable,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FileOverlap => "file-overlap",
            Self::DirectoryOverlap => "directory-overlap",
            Self::ServiceContention => "service-contention",
            Self::ResourceContention => "resource-contention",
            Self::SemanticOverlap => "semantic-overlap",
            Self::Unanalyzable => "unanalyzable",
        };
        f.write_str(s)
    }
}

/// Outcome of comparing two tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResult {
    pub has_conflict: bool,
    pub kinds: BTreeSet<ConflictKind>,
    /// Task that must run first, when one is declared
    pub ordering_hint: Option<TaskId>,
}

/// How the two ends of an edge must be ordered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type", content = "task")]
pub enum EdgeOrdering {
    /// The named task must complete before the other one starts
    Before(TaskId),
    /// Either order is fine, but never concurrently
    MutuallyExclusive,
}

/// A conflict or ordering fact between two tasks of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEdge {
    pub first: TaskId,
    pub second: TaskId,
    pub kinds: BTreeSet<ConflictKind>,
    pub ordering: EdgeOrdering,
}

impl ConflictEdge {
    /// `(predecessor, successor)` when the edge is ordered
    pub fn precedence(&self) -> Option<(&TaskId, &TaskId)> {
        match &self.ordering {
            EdgeOrdering::Before(id) if *id == self.first => Some((&self.first, &self.second)),
            EdgeOrdering::Before(_) => Some((&self.second, &self.first)),
            EdgeOrdering::MutuallyExclusive => None,
        }
    }

    /// Whether the edge forbids same-layer placement without ordering
    pub fn is_exclusion(&self) -> bool {
        !self.kinds.is_empty() && self.ordering == EdgeOrdering::MutuallyExclusive
    }
}

/// Reason the analysis could not complete for a pair
#[derive(Debug)]
enum AnalysisGap {
    SelfComparison,
    BadPath { task: TaskId, path: String },
}

/// Compare two tasks' declared footprints.
///
/// Kinds are evaluated in order: direct overlap, containment, service and
/// shared-state contention, semantic overlap. Never fails: an analysis gap
/// yields [`ConflictKind::Unanalyzable`].
pub fn detect(a: &Task, b: &Task) -> ConflictResult {
    let kinds = match analyze(a, b) {
        Ok(kinds) => kinds,
        Err(gap) => {
            warn!(a = %a.id, b = %b.id, ?gap, "conflict analysis incomplete, assuming conflict");
            BTreeSet::from([ConflictKind::Unanalyzable])
        }
    };

    let ordering_hint = if a.after.contains(&b.id) {
        Some(b.id.clone())
    } else if b.after.contains(&a.id) {
        Some(a.id.clone())
    } else {
        None
    };

    ConflictResult {
        has_conflict: !kinds.is_empty(),
        kinds,
        ordering_hint,
    }
}

/// Analyse every unordered pair once and keep the pairs that conflict or are ordered
#[instrument(skip_all, fields(tasks = tasks.len()))]
pub fn detect_all(tasks: &[Task]) -> Vec<ConflictEdge> {
    let mut edges = Vec::new();

    for (i, a) in tasks.iter().enumerate() {
        for b in &tasks[i + 1..] {
            let result = detect(a, b);
            if !result.has_conflict && result.ordering_hint.is_none() {
                continue;
            }

            let ordering = match result.ordering_hint {
                Some(first) => EdgeOrdering::Before(first),
                None => EdgeOrdering::MutuallyExclusive,
            };

            debug!(a = %a.id, b = %b.id, kinds = ?result.kinds, "conflict edge");
            edges.push(ConflictEdge {
                first: a.id.clone(),
                second: b.id.clone(),
                kinds: result.kinds,
                ordering,
            });
        }
    }

    edges
}

fn analyze(a: &Task, b: &Task) -> Result<BTreeSet<ConflictKind>, AnalysisGap> {
    if a.id == b.id {
        return Err(AnalysisGap::SelfComparison);
    }

    let a_files = normalized(a, &a.resources.files)?;
    let b_files = normalized(b, &b.resources.files)?;
    let a_dirs = normalized(a, &a.resources.directories)?;
    let b_dirs = normalized(b, &b.resources.directories)?;

    let mut kinds = BTreeSet::new();

    // 1. direct overlap
    if a_files.iter().any(|f| b_files.contains(f)) {
        kinds.insert(ConflictKind::FileOverlap);
    }
    if a_dirs.iter().any(|d| b_dirs.contains(d)) {
        kinds.insert(ConflictKind::DirectoryOverlap);
    }

    // 2. containment
    let contains_any = |dirs: &[String], paths: &[String]| {
        dirs.iter()
            .any(|d| paths.iter().any(|p| path_contains(d, p)))
    };
    if contains_any(&a_dirs, &b_files)
        || contains_any(&b_dirs, &a_files)
        || contains_any(&a_dirs, &b_dirs)
        || contains_any(&b_dirs, &a_dirs)
    {
        kinds.insert(ConflictKind::DirectoryOverlap);
    }

    // 3. external services and shared state
    if identifiers_overlap(&a.resources.services, &b.resources.services) {
        kinds.insert(ConflictKind::ServiceContention);
    }
    if identifiers_overlap(&a.resources.databases, &b.resources.databases)
        || identifiers_overlap(&a.resources.shared_state, &b.resources.shared_state)
    {
        kinds.insert(ConflictKind::ResourceContention);
    }

    // 4. declared semantic overlap
    if identifiers_overlap(&a.features, &b.features)
        || a.conflicts_with.contains(&b.id)
        || b.conflicts_with.contains(&a.id)
    {
        kinds.insert(ConflictKind::SemanticOverlap);
    }

    Ok(kinds)
}

fn normalized(task: &Task, paths: &[String]) -> Result<Vec<String>, AnalysisGap> {
    paths
        .iter()
        .map(|p| {
            normalize_path(p).ok_or_else(|| AnalysisGap::BadPath {
                task: task.id.clone(),
                path: p.clone(),
            })
        })
        .collect()
}

/// Case-insensitive identifier match where `db` also covers `db.table`
fn identifiers_overlap(a: &[String], b: &[String]) -> bool {
    let covers = |outer: &str, inner: &str| {
        inner == outer
            || (inner.len() > outer.len()
                && inner.starts_with(outer)
                && inner.as_bytes()[outer.len()] == b'.')
    };

    a.iter().any(|x| {
        let x = x.trim().to_lowercase();
        !x.is_empty()
            && b.iter().any(|y| {
                let y = y.trim().to_lowercase();
                covers(&x, &y) || covers(&y, &x)
            })
    })
}
