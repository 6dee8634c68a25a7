//! Prompt rendering: standing system instructions, the per-exchange project
//! snapshot and the opening message of each session kind.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{debug, instrument};

use crate::core::progress::ProgressSnapshot;
use crate::core::types::SessionKind;
use crate::io::git::Git;
use crate::io::init::ProjectPaths;
use crate::io::progress_store::ProgressStore;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const SNAPSHOT_TEMPLATE: &str = include_str!("prompts/snapshot.md");
const INITIALIZER_TEMPLATE: &str = include_str!("prompts/initializer.md");
const CODING_TEMPLATE: &str = include_str!("prompts/coding.md");

/// Entries never shown in the top-level listing.
const HIDDEN_ENTRIES: &[&str] = &[".git", "node_modules", ".autopilot", ".autopilot.lock"];
const RECENT_COMMITS: usize = 10;
const NOTES_TAIL_CHARS: usize = 2000;
const APP_SPEC_CHARS: usize = 20_000;

/// Project state shown to the engine on every exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSnapshot {
    pub listing: Vec<String>,
    pub recent_commits: Vec<String>,
    pub progress: ProgressSnapshot,
    pub notes_tail: Option<String>,
}

impl ProjectSnapshot {
    /// Read the snapshot from disk. Missing pieces are left empty.
    #[instrument(skip_all)]
    pub fn capture(root: &Path) -> Self {
        let store = ProgressStore::new(root);
        let git = Git::new(root);
        let recent_commits = if git.is_repository() {
            git.recent_log(RECENT_COMMITS).unwrap_or_else(|err| {
                debug!(err = %format!("{err:#}"), "no git history");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        Self {
            listing: top_level_listing(root),
            recent_commits,
            progress: store.snapshot(),
            notes_tail: store.notes_tail(NOTES_TAIL_CHARS),
        }
    }
}

fn top_level_listing(root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut listing: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if HIDDEN_ENTRIES.contains(&name.as_str()) {
                return None;
            }
            let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            Some(if is_dir { format!("{name}/") } else { name })
        })
        .collect();
    listing.sort();
    listing
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system template")?;
        env.add_template("snapshot", SNAPSHOT_TEMPLATE)
            .context("load snapshot template")?;
        env.add_template("initializer", INITIALIZER_TEMPLATE)
            .context("load initializer template")?;
        env.add_template("coding", CODING_TEMPLATE)
            .context("load coding template")?;
        Ok(Self { env })
    }

    /// Standing instructions, rendered once per process.
    pub fn render_base(&self, allowed_commands: &BTreeSet<String>) -> Result<String> {
        let template = self.env.get_template("system")?;
        Ok(template.render(context! { allowed_commands => allowed_commands })?)
    }

    /// Base instructions followed by the current project snapshot.
    pub fn render_system_prompt(&self, base: &str, snapshot: &ProjectSnapshot) -> Result<String> {
        let template = self.env.get_template("snapshot")?;
        let section = template.render(context! {
            progress_line => snapshot.progress.summary_line(),
            remaining => snapshot.progress.remaining_task_summaries,
            listing => snapshot.listing,
            commits => snapshot.recent_commits,
            notes => snapshot.notes_tail,
        })?;
        Ok(format!("{}\n\n{}", base.trim_end(), section.trim()))
    }

    /// First user message of a session.
    pub fn render_opening(
        &self,
        kind: SessionKind,
        session: u32,
        progress: &ProgressSnapshot,
        app_spec: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template(kind.as_str())?;
        let rendered = template.render(context! {
            session => session,
            progress_line => progress.summary_line(),
            remaining => progress.remaining_task_summaries,
            app_spec => app_spec.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered.trim().to_string())
    }
}

/// Read `app_spec.txt` for the initializer prompt, capped in size.
pub fn read_app_spec(paths: &ProjectPaths) -> Option<String> {
    let text = fs::read_to_string(&paths.app_spec_path).ok()?;
    Some(text.chars().take(APP_SPEC_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command_policy::default_allowed_commands;

    /// Verifies the base prompt lists the allowed commands.
    #[test]
    fn base_prompt_lists_allowed_commands() {
        let engine = PromptEngine::new().expect("templates");
        let base = engine
            .render_base(&default_allowed_commands())
            .expect("render");
        assert!(base.contains("npm"));
        assert!(base.contains("passes"));
    }

    /// Verifies the snapshot is appended after the base prompt.
    #[test]
    fn system_prompt_includes_snapshot() {
        let engine = PromptEngine::new().expect("templates");
        let snapshot = ProjectSnapshot {
            listing: vec!["package.json".to_string(), "src/".to_string()],
            recent_commits: vec!["abc123 add login".to_string()],
            progress: ProgressSnapshot {
                total_tasks: 4,
                passing_tasks: 1,
                remaining_task_summaries: vec!["#2: logout".to_string()],
            },
            notes_tail: Some("did login".to_string()),
        };
        let prompt = engine
            .render_system_prompt("BASE", &snapshot)
            .expect("render");
        assert!(prompt.starts_with("BASE\n\n## Project state"));
        assert!(prompt.contains("1/4 tasks passing (25.0%)"));
        assert!(prompt.contains("- #2: logout"));
        assert!(prompt.contains("- src/"));
        assert!(prompt.contains("- abc123 add login"));
        assert!(prompt.contains("did login"));
    }

    /// Verifies an empty project renders placeholder text.
    #[test]
    fn empty_snapshot_renders_placeholders() {
        let engine = PromptEngine::new().expect("templates");
        let prompt = engine
            .render_system_prompt("BASE", &ProjectSnapshot::default())
            .expect("render");
        assert!(prompt.contains("no task list yet"));
        assert!(prompt.contains("(empty project)"));
        assert!(prompt.contains("No git history yet."));
    }

    /// Verifies initializer and coding sessions open differently.
    #[test]
    fn opening_messages_differ_by_kind() {
        let engine = PromptEngine::new().expect("templates");
        let progress = ProgressSnapshot::default();
        let init = engine
            .render_opening(SessionKind::Initializer, 1, &progress, Some("A todo app"))
            .expect("render");
        assert!(init.contains("feature_list.json"));
        assert!(init.contains("A todo app"));

        let coding = engine
            .render_opening(SessionKind::Coding, 7, &progress, None)
            .expect("render");
        assert!(coding.starts_with("This is session 7."));
    }

    /// Verifies the project listing hides supervisor files.
    #[test]
    fn capture_hides_supervisor_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(".autopilot")).expect("mkdir");
        fs::create_dir_all(temp.path().join("node_modules")).expect("mkdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("index.html"), "").expect("write");
        let snapshot = ProjectSnapshot::capture(temp.path());
        assert_eq!(snapshot.listing, vec!["index.html", "src/"]);
        assert!(snapshot.recent_commits.is_empty());
        assert_eq!(snapshot.progress.total_tasks, 0);
    }
}
