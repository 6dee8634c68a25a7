//! Orchestrator: the multi-session loop behind `autopilot run`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::progress::ProgressSnapshot;
use crate::core::types::{SessionEndReason, SessionKind, StopReason};
use crate::dispatch::ToolDispatcher;
use crate::io::config::{AgentConfig, write_atomic};
use crate::io::engine::{ReasoningEngine, RetryPolicy};
use crate::io::init::{ProjectPaths, ensure_state_dir};
use crate::io::lock;
use crate::io::progress_store::ProgressStore;
use crate::io::prompt::{PromptEngine, read_app_spec};
use crate::io::run_state::{load_or_default, write_run_state};
use crate::io::session_log::SessionLog;
use crate::session::{SessionContext, SessionOutcome, run_session};

/// Caller-controlled limits for one invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Sessions to run in this invocation; `None` runs until completion.
    pub max_sessions: Option<u32>,
    /// Application spec copied to `app_spec.txt` when the project has none.
    pub spec: Option<PathBuf>,
    /// Mirror session logs to stdout.
    pub echo: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_sessions: None,
            spec: None,
            echo: true,
        }
    }
}

/// Summary of a `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stop: StopReason,
    pub sessions_run: u32,
    pub elapsed: Duration,
    pub progress: ProgressSnapshot,
    /// Failure detail when `stop` is [`StopReason::FatalError`].
    pub error: Option<String>,
}

/// Persisted per-session metadata (`.autopilot/sessions/<n>.json`).
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub index: u32,
    pub kind: SessionKind,
    pub reason: SessionEndReason,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tool_calls: u32,
    pub files_written: Vec<String>,
    pub progress_before: ProgressSnapshot,
    pub progress_after: ProgressSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run sessions until the task list passes, the session cap is reached, a
/// session fails fatally, or `cancel` is raised.
///
/// Holds the project lock for the whole run. Dev servers and the browser
/// are released before returning.
#[instrument(skip_all, fields(root = %config.working_directory.display()))]
pub fn run(
    config: &AgentConfig,
    engine: &dyn ReasoningEngine,
    dispatcher: &mut ToolDispatcher,
    options: &RunOptions,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    let paths = ProjectPaths::new(&config.working_directory);
    let _lock = lock::acquire(&paths.lock_path)?;
    let outcome = run_locked(config, engine, dispatcher, options, cancel, &paths);
    dispatcher.shutdown();
    outcome
}

fn run_locked(
    config: &AgentConfig,
    engine: &dyn ReasoningEngine,
    dispatcher: &mut ToolDispatcher,
    options: &RunOptions,
    cancel: &CancelToken,
    paths: &ProjectPaths,
) -> Result<RunOutcome> {
    ensure_state_dir(paths)?;
    let store = ProgressStore::new(&paths.root);
    if let Some(spec) = &options.spec
        && store.copy_spec(spec)?
    {
        info!(spec = %spec.display(), "copied app spec into project");
    }

    let prompts = PromptEngine::new()?;
    let ctx = SessionContext {
        config,
        engine,
        prompts: &prompts,
        retry: RetryPolicy::from_settings(&config.settings.engine),
        cancel,
    };
    let mut run_state = load_or_default(&paths.run_state_path)?;
    let started = Instant::now();
    let mut sessions_run = 0u32;
    let mut error = None;

    let stop = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if store.snapshot().is_complete() {
            break StopReason::Completed;
        }
        if options.max_sessions.is_some_and(|max| sessions_run >= max) {
            break StopReason::IterationCap;
        }
        if sessions_run > 0 {
            let delay = config.settings.session_delay();
            info!(delay_secs = delay.as_secs(), "waiting before next session");
            if cancel.sleep(delay) {
                break StopReason::Cancelled;
            }
        }

        let index = run_state.next_session;
        let outcome = run_one(&ctx, dispatcher, &store, paths, index, options.echo)?;
        sessions_run += 1;

        run_state.next_session = index + 1;
        run_state.last_reason = Some(outcome.reason);
        run_state.cumulative_elapsed_ms += elapsed_ms(&outcome);
        write_run_state(&paths.run_state_path, &run_state)?;

        match outcome.reason {
            SessionEndReason::FatalError => {
                error = outcome.error;
                break StopReason::FatalError;
            }
            SessionEndReason::Cancelled => break StopReason::Cancelled,
            _ => {}
        }
    };

    let progress = store.snapshot();
    info!(stop = %stop, sessions_run, "run finished");
    Ok(RunOutcome {
        stop,
        sessions_run,
        elapsed: started.elapsed(),
        progress,
        error,
    })
}

fn run_one(
    ctx: &SessionContext<'_>,
    dispatcher: &mut ToolDispatcher,
    store: &ProgressStore,
    paths: &ProjectPaths,
    index: u32,
    echo: bool,
) -> Result<SessionOutcome> {
    let progress_before = store.snapshot();
    let kind = if store.has_task_list() {
        SessionKind::Coding
    } else {
        SessionKind::Initializer
    };
    let app_spec = match kind {
        SessionKind::Initializer => read_app_spec(paths),
        SessionKind::Coding => None,
    };
    let opening = ctx
        .prompts
        .render_opening(kind, index, &progress_before, app_spec.as_deref())?;

    let output_chars = ctx.config.settings.log_output_chars;
    let log_path = paths.session_log_path(index);
    let mut log = SessionLog::open(&log_path, echo, output_chars).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "session log unavailable");
        SessionLog::disabled(echo, output_chars)
    });
    log.line(format!("=== session {index} ({}) ===", kind.as_str()));
    log.line(format!("progress: {}", progress_before.summary_line()));
    if kind == SessionKind::Initializer && app_spec.is_none() {
        log.line("warning: no app_spec.txt found; the agent has no specification to work from");
    }

    let started_at = Utc::now();
    let outcome = run_session(ctx, dispatcher, opening, &mut log);

    let record = SessionRecord {
        index,
        kind,
        reason: outcome.reason,
        started_at,
        duration_ms: elapsed_ms(&outcome),
        tool_calls: outcome.state.tool_call_count,
        files_written: outcome
            .state
            .files_written
            .iter()
            .map(|path| path.display().to_string())
            .collect(),
        progress_before,
        progress_after: store.snapshot(),
        error: outcome.error.clone(),
    };
    log.line(format!("progress: {}", record.progress_after.summary_line()));
    write_session_record(paths, &record)?;
    Ok(outcome)
}

fn elapsed_ms(outcome: &SessionOutcome) -> u64 {
    (Utc::now() - outcome.state.started_at)
        .num_milliseconds()
        .max(0) as u64
}

fn write_session_record(paths: &ProjectPaths, record: &SessionRecord) -> Result<()> {
    let mut json = serde_json::to_string_pretty(record).context("serialize session record")?;
    json.push('\n');
    write_atomic(&paths.session_meta_path(record.index), &json)
}
