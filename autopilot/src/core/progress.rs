//! Task-list model, progress accounting and the task-list contract audit.

use serde::{Deserialize, Serialize};

/// Maximum remaining-task summaries carried in a snapshot.
pub const MAX_REMAINING_SUMMARIES: usize = 10;

/// One entry of the persisted task list (`feature_list.json`).
///
/// The list is authored by the supervised agent; every field except `passes`
/// is meant to be immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub passes: bool,
}

impl Task {
    /// Stable label: the explicit id, else the 1-based position.
    pub fn label(&self, index: usize) -> String {
        match &self.id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => format!("#{}", index + 1),
        }
    }
}

/// Read-only view over the task list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total_tasks: usize,
    pub passing_tasks: usize,
    pub remaining_task_summaries: Vec<String>,
}

impl ProgressSnapshot {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let passing_tasks = tasks.iter().filter(|task| task.passes).count();
        let remaining_task_summaries = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| !task.passes)
            .take(MAX_REMAINING_SUMMARIES)
            .map(|(index, task)| format!("{}: {}", task.label(index), task.description.trim()))
            .collect();
        Self {
            total_tasks: tasks.len(),
            passing_tasks,
            remaining_task_summaries,
        }
    }

    /// Complete means a non-empty list with every task passing.
    pub fn is_complete(&self) -> bool {
        self.total_tasks > 0 && self.passing_tasks == self.total_tasks
    }

    pub fn percent(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.passing_tasks as f64 * 100.0 / self.total_tasks as f64
    }

    pub fn summary_line(&self) -> String {
        if self.total_tasks == 0 {
            return "no task list yet".to_string();
        }
        format!(
            "{}/{} tasks passing ({:.1}%)",
            self.passing_tasks,
            self.total_tasks,
            self.percent()
        )
    }
}

/// Compare two versions of the task list and report edits to anything other
/// than `passes`.
///
/// The agent is instructed to only flip `passes`; this audit makes violations
/// visible without rejecting them. Messages are ordered by task position.
pub fn audit_task_list(prev: &[Task], next: &[Task]) -> Vec<String> {
    let mut findings = Vec::new();
    for (index, before) in prev.iter().enumerate() {
        let label = before.label(index);
        let Some(after) = next.get(index) else {
            findings.push(format!("task {label} removed"));
            continue;
        };
        if after.id != before.id {
            findings.push(format!("task {label} changed id"));
        }
        if after.category != before.category {
            findings.push(format!("task {label} changed category"));
        }
        if after.description != before.description {
            findings.push(format!("task {label} changed description"));
        }
        if after.steps != before.steps {
            findings.push(format!("task {label} changed steps"));
        }
    }
    if next.len() > prev.len() && !prev.is_empty() {
        findings.push(format!(
            "task list grew from {} to {} entries",
            prev.len(),
            next.len()
        ));
    }
    findings
}

/// Labels of tasks that passed in `prev` but no longer pass in `next`.
///
/// Regressions are allowed (the agent re-marks broken features), but they are
/// worth surfacing in the session log.
pub fn regressed_tasks(prev: &[Task], next: &[Task]) -> Vec<String> {
    prev.iter()
        .zip(next)
        .enumerate()
        .filter(|(_, (before, after))| before.passes && !after.passes)
        .map(|(index, (before, _))| before.label(index))
        .collect()
}
