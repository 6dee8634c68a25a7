//! Durable progress artifacts in the project root: the task list
//! (`feature_list.json`), free-text progress notes (`agent-progress.txt`) and
//! the application spec (`app_spec.txt`).
//!
//! The supervised agent authors all three; the supervisor only reads them,
//! except for copying the spec on a fresh start.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::progress::{ProgressSnapshot, Task};
use crate::io::init::ProjectPaths;

/// Read/derive progress from the files under a project root.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    paths: ProjectPaths,
}

impl ProgressStore {
    pub fn new(root: &Path) -> Self {
        Self {
            paths: ProjectPaths::new(root),
        }
    }

    /// True once the agent has written a task list (initializer done).
    pub fn has_task_list(&self) -> bool {
        self.paths.task_list_path.exists()
    }

    /// Parse the task list. `Ok(None)` when the file does not exist.
    pub fn load_tasks(&self) -> Result<Option<Vec<Task>>> {
        let path = &self.paths.task_list_path;
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let tasks: Vec<Task> =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(tasks))
    }

    /// Current tasks, treating a missing or unreadable list as empty.
    pub fn tasks_or_empty(&self) -> Vec<Task> {
        match self.load_tasks() {
            Ok(tasks) => tasks.unwrap_or_default(),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "task list unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    /// Recompute the snapshot from disk. Never cached.
    #[instrument(skip_all)]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let snapshot = ProgressSnapshot::from_tasks(&self.tasks_or_empty());
        debug!(
            total = snapshot.total_tasks,
            passing = snapshot.passing_tasks,
            "progress snapshot"
        );
        snapshot
    }

    /// Last `max_chars` characters of the progress notes, if any.
    pub fn notes_tail(&self, max_chars: usize) -> Option<String> {
        let contents = fs::read_to_string(&self.paths.notes_path).ok()?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return None;
        }
        let count = trimmed.chars().count();
        if count <= max_chars {
            return Some(trimmed.to_string());
        }
        let tail: String = trimmed.chars().skip(count - max_chars).collect();
        Some(format!("...{tail}"))
    }

    /// Copy the application spec into the project unless one is present.
    ///
    /// Returns `true` when a copy was made.
    pub fn copy_spec(&self, source: &Path) -> Result<bool> {
        if self.paths.app_spec_path.exists() {
            debug!("app spec already present, not copying");
            return Ok(false);
        }
        fs::copy(source, &self.paths.app_spec_path).with_context(|| {
            format!(
                "copy spec {} to {}",
                source.display(),
                self.paths.app_spec_path.display()
            )
        })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = r#"[
        {"category": "functional", "description": "login", "steps": ["open", "submit"], "passes": true},
        {"category": "style", "description": "dark mode", "steps": [], "passes": false}
    ]"#;

    /// Verifies a missing task list reads as an empty snapshot.
    #[test]
    fn missing_list_is_empty_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ProgressStore::new(temp.path());
        assert!(!store.has_task_list());
        assert_eq!(store.load_tasks().expect("load"), None);
        assert_eq!(store.snapshot(), ProgressSnapshot::default());
    }

    /// Verifies the snapshot matches the task list on disk.
    #[test]
    fn snapshot_reflects_file_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("feature_list.json"), LIST).expect("write");
        let store = ProgressStore::new(temp.path());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.total_tasks, 2);
        assert_eq!(snapshot.passing_tasks, 1);
        assert_eq!(snapshot.remaining_task_summaries, vec!["#2: dark mode"]);
    }

    /// Verifies a malformed task list does not fail the snapshot.
    #[test]
    fn malformed_list_is_empty_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("feature_list.json"), "{ not json").expect("write");
        let store = ProgressStore::new(temp.path());
        assert!(store.has_task_list());
        assert!(store.load_tasks().is_err());
        assert_eq!(store.snapshot().total_tasks, 0);
    }

    /// Verifies the notes excerpt keeps the newest lines.
    #[test]
    fn notes_tail_keeps_the_end() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ProgressStore::new(temp.path());
        assert_eq!(store.notes_tail(10), None);
        fs::write(temp.path().join("agent-progress.txt"), "session one\nsession two\n")
            .expect("write");
        assert_eq!(store.notes_tail(100).as_deref(), Some("session one\nsession two"));
        assert_eq!(store.notes_tail(3).as_deref(), Some("...two"));
    }

    /// Verifies the app spec is copied on a fresh start and never overwritten.
    #[test]
    fn spec_is_copied_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = temp.path().join("spec-src.txt");
        fs::write(&spec, "build a todo app").expect("write");
        let store = ProgressStore::new(temp.path());
        assert!(store.copy_spec(&spec).expect("copy"));
        fs::write(&spec, "changed").expect("write");
        assert!(!store.copy_spec(&spec).expect("second copy"));
        assert_eq!(
            fs::read_to_string(temp.path().join("app_spec.txt")).expect("read"),
            "build a todo app"
        );
    }
}
