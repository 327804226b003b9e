//! Task batch planning for large stories.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::analyzer::{StoryAnalysis, StoryScope, TaskInfo};

/// Maximum tasks a single dev-story dispatch is asked to implement.
pub const TASKS_PER_BATCH: usize = 5;

/// One contiguous batch of tasks dispatched together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBatch {
    pub batch_index: usize,
    pub task_ids: Vec<u32>,
    pub task_titles: Vec<String>,
    /// De-duplicated union of the member tasks' AC refs, ascending.
    pub ac_refs: Vec<u32>,
}

impl TaskBatch {
    fn from_tasks(batch_index: usize, tasks: &[TaskInfo]) -> Self {
        let mut ac_refs = BTreeSet::new();
        for task in tasks {
            ac_refs.extend(task.ac_refs.iter().copied());
        }
        Self {
            batch_index,
            task_ids: tasks.iter().map(|t| t.id).collect(),
            task_titles: tasks.iter().map(|t| t.title.clone()).collect(),
            ac_refs: ac_refs.into_iter().collect(),
        }
    }

    /// Render the `Tn: title` lines handed to the dev-story agent as its
    /// task scope.
    pub fn scope_lines(&self) -> String {
        self.task_ids
            .iter()
            .zip(&self.task_titles)
            .map(|(id, title)| format!("T{id}: {title}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Split an analyzed story into dispatch batches.
///
/// Small and medium stories always get one batch with every task in input
/// order, even past `TASKS_PER_BATCH`. Large stories are partitioned into
/// id-ordered contiguous runs of at most `TASKS_PER_BATCH`, so every id in
/// a batch precedes every id of later batches. Empty input yields a single
/// empty batch at index 0.
pub fn plan_task_batches(analysis: &StoryAnalysis) -> Vec<TaskBatch> {
    if analysis.tasks.is_empty() {
        return vec![TaskBatch {
            batch_index: 0,
            task_ids: Vec::new(),
            task_titles: Vec::new(),
            ac_refs: Vec::new(),
        }];
    }

    if analysis.estimated_scope != StoryScope::Large {
        return vec![TaskBatch::from_tasks(0, &analysis.tasks)];
    }

    let mut ordered = analysis.tasks.clone();
    ordered.sort_by_key(|t| t.id);
    ordered
        .chunks(TASKS_PER_BATCH)
        .enumerate()
        .map(|(index, chunk)| TaskBatch::from_tasks(index, chunk))
        .collect()
}
