//! Run state storage for cross-process session bookkeeping.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::write_atomic;
use crate::core::types::SessionEndReason;

/// Persisted bookkeeping for the project (`.autopilot/run_state.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    /// Next session number (1-indexed, monotonically increasing across restarts).
    pub next_session: u32,
    /// How the previous session ended.
    pub last_reason: Option<SessionEndReason>,
    /// Wall-clock time spent in sessions across all runs.
    pub cumulative_elapsed_ms: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            next_session: 1,
            last_reason: None,
            cumulative_elapsed_ms: 0,
        }
    }
}

/// Load run state from disk.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let state: RunState =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    debug!(next_session = state.next_session, "run state loaded");
    Ok(state)
}

/// Like [`load_run_state`], but a project that never ran starts at session 1.
pub fn load_or_default(path: &Path) -> Result<RunState> {
    match path.try_exists() {
        Ok(true) => load_run_state(path),
        Ok(false) => Ok(RunState::default()),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    let mut json = serde_json::to_string_pretty(state).context("serialize run state")?;
    json.push('\n');
    write_atomic(path, &json)?;
    debug!(next_session = state.next_session, "run state saved");
    Ok(())
}
