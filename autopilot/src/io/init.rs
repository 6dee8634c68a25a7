//! Canonical paths under a project root and `.autopilot/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ConfigError, FileConfig, contains_path, write_config};

const STATE_GITIGNORE: &str = "# Supervisor state; not part of the generated app.\n*\n";

/// All supervisor-owned paths for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub run_state_path: PathBuf,
    pub logs_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub servers_dir: PathBuf,
    pub screenshots_dir: PathBuf,
    pub lock_path: PathBuf,
    pub task_list_path: PathBuf,
    pub notes_path: PathBuf,
    pub app_spec_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".autopilot");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: state_dir.join(".gitignore"),
            run_state_path: state_dir.join("run_state.json"),
            logs_dir: state_dir.join("logs"),
            sessions_dir: state_dir.join("sessions"),
            servers_dir: state_dir.join("servers"),
            screenshots_dir: state_dir.join("screenshots"),
            lock_path: root.join(".autopilot.lock"),
            task_list_path: root.join("feature_list.json"),
            notes_path: root.join("agent-progress.txt"),
            app_spec_path: root.join("app_spec.txt"),
        }
    }

    pub fn session_log_path(&self, index: u32) -> PathBuf {
        self.logs_dir.join(format!("session-{index}.log"))
    }

    pub fn session_meta_path(&self, index: u32) -> PathBuf {
        self.sessions_dir.join(format!("{index}.json"))
    }

    pub fn server_log_path(&self, slot: &str) -> PathBuf {
        self.servers_dir.join(format!("{slot}.log"))
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite an existing config file.
    pub force: bool,
}

/// Ensure `.autopilot/` exists with its ignore file.
pub fn ensure_state_dir(paths: &ProjectPaths) -> Result<()> {
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create {}", paths.state_dir.display()))?;
    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, STATE_GITIGNORE)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }
    Ok(())
}

/// Create `.autopilot/` under `root` and write the default config to
/// `config_path`, which must lie outside `root`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_project(
    root: &Path,
    config_path: &Path,
    options: &InitOptions,
) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
    if let Some(root) = contains_path(root, config_path) {
        return Err(ConfigError::ConfigInsideRoot {
            config: config_path.to_path_buf(),
            root,
        }
        .into());
    }
    if config_path.exists() && !options.force {
        return Err(anyhow!(
            "autopilot init: {} already exists (use --force to overwrite)",
            config_path.display()
        ));
    }
    ensure_state_dir(&paths)?;
    write_config(config_path, &FileConfig::default())?;
    Ok(paths)
}
