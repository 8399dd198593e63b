//! Execution plan construction
//!
//! Precedence edges (from ordering hints and `after` declarations) drive a
//! Kahn-style topological layering. Exclusion edges (conflicts without an
//! ordering) only constrain which ready tasks may share a layer; each ready
//! set is split with a greedy first-fit coloring.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use switchyard_core::AnalysisError;

use crate::conflict::{detect_all, ConflictEdge};
use crate::task::{Task, TaskId};

/// Ordered parallel layers for a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Layer 0 runs first; tasks within a layer run concurrently
    layers: Vec<Vec<TaskId>>,
    /// Tasks that must complete before each task
    #[serde(default)]
    predecessors: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl ExecutionPlan {
    /// Detect conflicts between all tasks, then build the plan
    pub fn analyze(tasks: &[Task]) -> Result<Self, AnalysisError> {
        validate_tasks(tasks)?;
        let conflicts = detect_all(tasks);
        Self::build(tasks, &conflicts)
    }

    /// Build a plan from tasks and their precomputed conflict edges
    #[instrument(skip_all, fields(tasks = tasks.len(), conflicts = conflicts.len()))]
    pub fn build(tasks: &[Task], conflicts: &[ConflictEdge]) -> Result<Self, AnalysisError> {
        validate_tasks(tasks)?;

        let order: HashMap<&TaskId, usize> =
            tasks.iter().enumerate().map(|(i, t)| (&t.id, i)).collect();

        let mut predecessors: BTreeMap<TaskId, BTreeSet<TaskId>> = tasks
            .iter()
            .map(|t| (t.id.clone(), BTreeSet::new()))
            .collect();
        let mut exclusions: HashMap<&TaskId, HashSet<&TaskId>> = HashMap::new();

        for task in tasks {
            for dep in &task.after {
                if let Some(preds) = predecessors.get_mut(&task.id) {
                    preds.insert(dep.clone());
                }
            }
        }

        for edge in conflicts {
            for id in [&edge.first, &edge.second] {
                if !order.contains_key(id) {
                    return Err(AnalysisError::UnknownTask {
                        task: edge.first.to_string(),
                        reference: id.to_string(),
                    });
                }
            }

            if let Some((before, after)) = edge.precedence() {
                if let Some(preds) = predecessors.get_mut(after) {
                    preds.insert(before.clone());
                }
            } else if edge.is_exclusion() {
                exclusions.entry(&edge.first).or_default().insert(&edge.second);
                exclusions.entry(&edge.second).or_default().insert(&edge.first);
            }
        }

        let mut successors: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
        let mut in_degree: HashMap<&TaskId, usize> = HashMap::new();
        for (id, preds) in &predecessors {
            in_degree.insert(id, preds.len());
            for pred in preds {
                successors.entry(pred).or_default().push(id);
            }
        }

        let mut remaining: Vec<&TaskId> = tasks.iter().map(|t| &t.id).collect();
        let mut layers: Vec<Vec<TaskId>> = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&TaskId>, Vec<&TaskId>) = remaining
                .iter()
                .copied()
                .partition(|id| in_degree.get(*id).copied().unwrap_or(0) == 0);

            if ready.is_empty() {
                let cyclic: Vec<String> = blocked.iter().map(|id| id.to_string()).collect();
                return Err(AnalysisError::CyclicDependency(cyclic));
            }

            let round = color_ready_set(&ready, &exclusions);
            debug!(
                ready = ready.len(),
                sub_layers = round.len(),
                "partitioned ready set"
            );
            layers.extend(round);

            for id in &ready {
                for succ in successors.get(*id).map(Vec::as_slice).unwrap_or_default() {
                    if let Some(degree) = in_degree.get_mut(*succ) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
            remaining = blocked;
        }

        info!(
            task_count = tasks.len(),
            layer_count = layers.len(),
            "execution plan built"
        );

        Ok(Self {
            layers,
            predecessors,
        })
    }

    /// Rebuild a plan from persisted layers
    pub fn from_parts(
        layers: Vec<Vec<TaskId>>,
        predecessors: BTreeMap<TaskId, BTreeSet<TaskId>>,
    ) -> Self {
        Self {
            layers,
            predecessors,
        }
    }

    /// Get execution layers
    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    /// Index of the layer holding a task
    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.layers.iter().position(|layer| layer.contains(id))
    }

    /// Tasks that must complete before `id`
    pub fn predecessors(&self, id: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.predecessors.get(id).into_iter().flatten()
    }

    /// Get the total number of tasks
    pub fn len(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Check if the plan is empty
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Get a human-readable summary of the execution plan
    pub fn describe(&self, tasks: &[Task]) -> String {
        let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
        let mut plan = String::new();

        for (i, layer) in self.layers.iter().enumerate() {
            plan.push_str(&format!("Layer {} ({} tasks):\n", i, layer.len()));
            for id in layer {
                let Some(task) = by_id.get(id) else { continue };
                let cmd = task.command.as_deref().unwrap_or("<no command>");
                let deps: Vec<String> = self.predecessors(id).map(|d| d.to_string()).collect();
                let eta = task
                    .estimate
                    .duration_secs
                    .map(|s| format!(" ~{}s", s))
                    .unwrap_or_default();
                if deps.is_empty() {
                    plan.push_str(&format!("  {} [{}] -> {}{}\n", id, task.kind, cmd, eta));
                } else {
                    plan.push_str(&format!(
                        "  {} [{}] -> {}{} (after: {})\n",
                        id,
                        task.kind,
                        cmd,
                        eta,
                        deps.join(", ")
                    ));
                }
            }
        }
        plan
    }
}

/// First-fit coloring of a ready set so no sub-layer holds an exclusion pair
fn color_ready_set(
    ready: &[&TaskId],
    exclusions: &HashMap<&TaskId, HashSet<&TaskId>>,
) -> Vec<Vec<TaskId>> {
    let mut sub_layers: Vec<Vec<&TaskId>> = Vec::new();

    for id in ready {
        let excluded = exclusions.get(*id);
        let slot = sub_layers.iter().position(|layer| {
            excluded.map_or(true, |ex| !layer.iter().any(|other| ex.contains(other)))
        });
        match slot {
            Some(i) => sub_layers[i].push(*id),
            None => sub_layers.push(vec![*id]),
        }
    }

    sub_layers
        .into_iter()
        .map(|layer| layer.into_iter().cloned().collect())
        .collect()
}

/// Check ids and cross-references before planning
fn validate_tasks(tasks: &[Task]) -> Result<(), AnalysisError> {
    let mut seen = HashSet::new();
    for task in tasks {
        if task.id.as_str().trim().is_empty() {
            return Err(AnalysisError::EmptyTaskId);
        }
        if !seen.insert(&task.id) {
            return Err(AnalysisError::DuplicateTask(task.id.to_string()));
        }
    }

    for task in tasks {
        for reference in task.after.iter().chain(&task.conflicts_with) {
            if !seen.contains(reference) {
                return Err(AnalysisError::UnknownTask {
                    task: task.id.to_string(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    Ok(())
}
