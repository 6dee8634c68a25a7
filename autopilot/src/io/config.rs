//! Supervisor configuration.
//!
//! Two layers: an optional, human-edited TOML file (`autopilot.toml` in the
//! invoking directory by default) and the immutable [`AgentConfig`] assembled
//! once per process from that file, the environment and CLI overrides.
//!
//! The file decides what the sandbox allows, so it must live outside the
//! project root where the agent's commands cannot reach it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::command_policy::default_allowed_commands;

pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";
pub const MODEL_ENV: &str = "OPENROUTER_MODEL";
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
pub const GENERATIONS_DIR: &str = "generations";
pub const DEFAULT_CONFIG_FILE: &str = "autopilot.toml";

/// Configuration problems that must stop the process before any session.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "OPENROUTER_API_KEY is not set; export it or add it to a .env file \
         (get a key at https://openrouter.ai/keys)"
    )]
    MissingApiKey,
    #[error("project directory {0} does not exist")]
    RootMissing(PathBuf),
    #[error("project directory {0} is not a directory")]
    RootNotDirectory(PathBuf),
    #[error("project directory {path} is not writable: {source}")]
    RootNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "config file {config} is inside project directory {root}; \
         move it outside so the agent cannot rewrite it"
    )]
    ConfigInsideRoot { config: PathBuf, root: PathBuf },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings file (TOML). Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// Tool-call budget per session.
    pub max_tool_calls: u32,
    /// Pause between sessions.
    pub session_delay_secs: u64,
    /// Default timeout for `run_command`.
    pub command_timeout_secs: u64,
    /// Captured stdout/stderr beyond this many bytes is discarded.
    pub output_limit_bytes: usize,
    /// Tool output is truncated to this many characters in the session log.
    pub log_output_chars: usize,
    /// When false, `run_command` skips the command validator. Path
    /// confinement for filesystem tools still applies.
    pub sandbox_enabled: bool,
    pub allowed_commands: BTreeSet<String>,
    pub engine: EngineSettings,
    pub browser: BrowserSettings,
    /// Passed verbatim into every engine request body.
    pub extra_options: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            request_timeout_secs: 600,
            max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrowserSettings {
    /// WebDriver endpoint (e.g. `http://localhost:9515` for chromedriver).
    /// Browser tools report an error while unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdriver_url: Option<String>,
    pub headless: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: None,
            headless: true,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 50,
            session_delay_secs: 3,
            command_timeout_secs: 300,
            output_limit_bytes: 100_000,
            log_output_chars: 500,
            sandbox_enabled: true,
            allowed_commands: default_allowed_commands(),
            engine: EngineSettings::default(),
            browser: BrowserSettings::default(),
            extra_options: BTreeMap::new(),
        }
    }
}

impl FileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tool_calls == 0 {
            return Err(anyhow!("max_tool_calls must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.engine.base_url.trim().is_empty() {
            return Err(anyhow!("engine.base_url must not be empty"));
        }
        if self.engine.request_timeout_secs == 0 {
            return Err(anyhow!("engine.request_timeout_secs must be > 0"));
        }
        if self.allowed_commands.iter().any(|cmd| cmd.trim().is_empty()) {
            return Err(anyhow!("allowed_commands must not contain empty entries"));
        }
        Ok(())
    }

    pub fn session_delay(&self) -> Duration {
        Duration::from_secs(self.session_delay_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FileConfig::default()`.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        let cfg = FileConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FileConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    debug!(path = %path.display(), "config loaded");
    Ok(cfg)
}

/// Load the config for a run rooted at `root`.
///
/// Refuses a file that resolves inside `root`: anything there is writable by
/// the agent's commands, including the sandbox settings themselves.
pub fn load_supervisor_config(path: &Path, root: &Path) -> Result<FileConfig, ConfigError> {
    if let Some(root) = contains_path(root, path) {
        return Err(ConfigError::ConfigInsideRoot {
            config: path.to_path_buf(),
            root,
        });
    }
    load_config(path).map_err(|err| ConfigError::Invalid(format!("{err:#}")))
}

/// The canonical `root` when `path` resolves under it.
pub(crate) fn contains_path(root: &Path, path: &Path) -> Option<PathBuf> {
    let root = root.canonicalize().ok()?;
    let resolved = match path.canonicalize() {
        Ok(resolved) => resolved,
        Err(_) => {
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let parent = parent
                .canonicalize()
                .or_else(|_| std::path::absolute(parent))
                .ok()?;
            parent.join(path.file_name()?)
        }
    };
    resolved.starts_with(&root).then_some(root)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FileConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Replace `path` with `contents` via a sibling temp file and a rename, so
/// readers never observe a half-written file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(anyhow!("not a file path: {}", path.display()));
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let staged = parent.join(format!(".{}.tmp", name.to_string_lossy()));
    fs::write(&staged, contents).with_context(|| format!("stage {}", staged.display()))?;
    fs::rename(&staged, path).with_context(|| format!("replace {}", path.display()))
}

/// Values read from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    pub api_key: Option<SecretString>,
    pub model: Option<String>,
}

impl EnvSettings {
    /// Load `.env` from the current directory (if any), then read variables.
    pub fn from_env() -> Self {
        if let Err(err) = dotenv::dotenv() {
            debug!(err = %err, "no .env file loaded");
        }
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            api_key: read(API_KEY_ENV).map(SecretString::from),
            model: read(MODEL_ENV),
        }
    }
}

/// CLI flags that take precedence over the file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub max_tool_calls: Option<u32>,
}

/// Immutable per-process configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Canonical sandbox root. Never changes after construction.
    pub working_directory: PathBuf,
    pub model_identifier: String,
    pub allowed_commands: BTreeSet<String>,
    pub sandbox_enabled: bool,
    /// Standing instructions; the per-exchange project snapshot is appended to this.
    pub system_prompt: String,
    pub max_tool_calls: u32,
    pub api_key: Option<SecretString>,
    pub extra_options: BTreeMap<String, Value>,
    pub settings: FileConfig,
}

impl AgentConfig {
    /// Assemble the process configuration. Fails fast on a missing credential
    /// or an unusable sandbox root.
    pub fn build(
        root: &Path,
        settings: FileConfig,
        env: EnvSettings,
        overrides: &Overrides,
        system_prompt: String,
    ) -> Result<Self, ConfigError> {
        let api_key = env.api_key.ok_or(ConfigError::MissingApiKey)?;
        let working_directory = canonical_root(root)?;
        settings
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        let max_tool_calls = overrides.max_tool_calls.unwrap_or(settings.max_tool_calls);
        if max_tool_calls == 0 {
            return Err(ConfigError::Invalid("max_tool_calls must be > 0".to_string()));
        }
        let model_identifier = overrides
            .model
            .clone()
            .or(env.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        if !settings.sandbox_enabled {
            warn!("sandbox disabled: run_command will not validate commands");
        }

        Ok(Self {
            working_directory,
            model_identifier,
            allowed_commands: settings.allowed_commands.clone(),
            sandbox_enabled: settings.sandbox_enabled,
            system_prompt,
            max_tool_calls,
            api_key: Some(api_key),
            extra_options: settings.extra_options.clone(),
            settings,
        })
    }
}

/// Canonicalize `root` and check it is a writable directory.
pub fn canonical_root(root: &Path) -> Result<PathBuf, ConfigError> {
    if !root.exists() {
        return Err(ConfigError::RootMissing(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(ConfigError::RootNotDirectory(root.to_path_buf()));
    }
    let canonical = root
        .canonicalize()
        .map_err(|source| ConfigError::RootNotWritable {
            path: root.to_path_buf(),
            source,
        })?;
    let probe = canonical.join(format!(".autopilot-probe-{}", std::process::id()));
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .map_err(|source| ConfigError::RootNotWritable {
            path: canonical.clone(),
            source,
        })?;
    if let Err(err) = fs::remove_file(&probe) {
        warn!(path = %probe.display(), err = %err, "failed to remove write probe");
    }
    Ok(canonical)
}

/// Resolve the `--project-dir` argument.
///
/// Relative paths are placed under `generations/` unless they already start
/// there. Absolute paths are used as given.
pub fn resolve_project_dir(requested: &Path) -> PathBuf {
    if requested.is_absolute() || requested.starts_with(GENERATIONS_DIR) {
        return requested.to_path_buf();
    }
    Path::new(GENERATIONS_DIR).join(requested)
}
