//! Session Runner: one bounded conversation with the reasoning engine.
//!
//! A session starts from a fresh [`SessionState`] seeded with the opening
//! prompt, then loops exchange by exchange: snapshot the project, ask the
//! engine for the next turn, dispatch its tool calls in order, feed results
//! back, and check the termination rule. The runner never returns `Err`;
//! engine failures end the session as [`SessionEndReason::FatalError`].

use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::nudge::NudgePolicy;
use crate::core::progress::{Task, audit_task_list, regressed_tasks};
use crate::core::termination::{SessionState, Streaks, check_termination};
use crate::core::tool_schema::tool_definitions;
use crate::core::types::{Message, SessionEndReason};
use crate::dispatch::ToolDispatcher;
use crate::io::config::AgentConfig;
use crate::io::engine::{EngineError, EngineRequest, ReasoningEngine, RetryPolicy, complete_with_retry};
use crate::io::progress_store::ProgressStore;
use crate::io::prompt::{ProjectSnapshot, PromptEngine};
use crate::io::session_log::{SessionLog, truncate_chars};

/// Sent after a final turn that called no tools.
pub const IDLE_CONTINUATION: &str = "You ended your turn without calling any tools. \
The work is not finished: continue implementing the remaining tasks using the tools. \
If you believe everything is done, verify it and update feature_list.json.";

/// Sent when the engine stopped mid-turn without calling tools.
const TRUNCATED_CONTINUATION: &str = "Your previous reply was cut off. Continue.";

/// Borrowed collaborators for one session.
pub struct SessionContext<'a> {
    pub config: &'a AgentConfig,
    pub engine: &'a dyn ReasoningEngine,
    pub prompts: &'a PromptEngine,
    pub retry: RetryPolicy,
    pub cancel: &'a CancelToken,
}

/// How a session ended.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub reason: SessionEndReason,
    pub state: SessionState,
    /// Set for [`SessionEndReason::FatalError`].
    pub error: Option<String>,
}

/// Run one session until a termination condition holds.
#[instrument(skip_all, fields(model = %ctx.config.model_identifier))]
pub fn run_session(
    ctx: &SessionContext<'_>,
    dispatcher: &mut ToolDispatcher,
    opening: String,
    log: &mut SessionLog,
) -> SessionOutcome {
    let config = ctx.config;
    let store = ProgressStore::new(&config.working_directory);
    let tasks_at_start = load_tasks_for_audit(&store);
    let tools = tool_definitions();

    let mut state = SessionState::new(Message::user(opening));
    let mut nudges = NudgePolicy::new();
    let mut streaks = Streaks::default();
    let mut error = None;

    let reason = 'session: loop {
        if ctx.cancel.is_cancelled() {
            break SessionEndReason::Cancelled;
        }

        let snapshot = ProjectSnapshot::capture(&config.working_directory);
        let system_prompt = match ctx
            .prompts
            .render_system_prompt(&config.system_prompt, &snapshot)
        {
            Ok(prompt) => prompt,
            Err(err) => {
                error = Some(format!("render system prompt: {err:#}"));
                break SessionEndReason::FatalError;
            }
        };
        let request = EngineRequest {
            system_prompt: &system_prompt,
            conversation_history: &state.conversation_history,
            model_identifier: &config.model_identifier,
            tool_schema: &tools,
        };

        let started = Instant::now();
        let response = match complete_with_retry(ctx.engine, &request, &ctx.retry, ctx.cancel) {
            Ok(response) => response,
            Err(EngineError::Cancelled) => break SessionEndReason::Cancelled,
            Err(err) => {
                warn!(err = %err, "engine call failed");
                log.line(format!("engine error: {err}"));
                error = Some(err.to_string());
                break SessionEndReason::FatalError;
            }
        };
        log.thinking(started.elapsed());
        if !response.assistant_text.trim().is_empty() {
            log.line(format!(
                "assistant: {}",
                truncate_chars(response.assistant_text.trim(), config.settings.log_output_chars)
            ));
        }

        let calls = response.tool_calls.clone();
        state
            .conversation_history
            .push(Message::assistant(response.assistant_text, response.tool_calls));

        if calls.is_empty() {
            streaks.record_tool_less(response.is_final_turn);
            if response.is_final_turn {
                log.line(format!("idle turn ({} in a row)", streaks.idle));
            } else {
                log.line(format!("truncated turn ({} in a row)", streaks.truncated));
            }
        } else {
            streaks.reset();
            for call in &calls {
                if state.tool_call_count >= config.max_tool_calls {
                    break;
                }
                if ctx.cancel.is_cancelled() {
                    break 'session SessionEndReason::Cancelled;
                }
                log.line(format!("tool {} requested", call.name));
                let result = dispatcher.dispatch(call, config, &mut state);
                state.tool_call_count += 1;
                nudges.record_result(&result);
                log.tool_result(&call.name, result.duration_ms, result.success, &result.output);
                state.conversation_history.push(Message::tool(&result));
            }
        }

        if ctx.cancel.is_cancelled() {
            break SessionEndReason::Cancelled;
        }
        let progress = store.snapshot();
        if let Some(reason) = check_termination(
            state.tool_call_count,
            config.max_tool_calls,
            &progress,
            streaks,
        ) {
            break reason;
        }

        let mut follow_up = Vec::new();
        if calls.is_empty() {
            follow_up.push(if response.is_final_turn {
                IDLE_CONTINUATION.to_string()
            } else {
                TRUNCATED_CONTINUATION.to_string()
            });
        }
        for nudge in nudges.due(state.tool_call_count, state.files_written.len()) {
            let text = nudge.message();
            log.line(format!("nudge: {text}"));
            follow_up.push(text);
        }
        if !follow_up.is_empty() {
            state
                .conversation_history
                .push(Message::user(follow_up.join("\n\n")));
        }
    };

    audit_session_tasks(&store, tasks_at_start.as_deref(), log);
    log.line(format!(
        "session ended: {reason} after {} tool calls, {} files written",
        state.tool_call_count,
        state.files_written.len()
    ));
    info!(reason = %reason, tool_calls = state.tool_call_count, "session ended");

    SessionOutcome {
        reason,
        state,
        error,
    }
}

fn load_tasks_for_audit(store: &ProgressStore) -> Option<Vec<Task>> {
    match store.load_tasks() {
        Ok(tasks) => tasks,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "task list unreadable at session start");
            None
        }
    }
}

/// Compare the task list against its state at session start and log
/// contract violations and regressions.
fn audit_session_tasks(store: &ProgressStore, before: Option<&[Task]>, log: &mut SessionLog) {
    let Some(before) = before else {
        return;
    };
    let after = match store.load_tasks() {
        Ok(Some(tasks)) => tasks,
        Ok(None) => {
            log.line("task list warning: feature_list.json was deleted");
            return;
        }
        Err(err) => {
            log.line(format!("task list warning: {err:#}"));
            return;
        }
    };
    for warning in audit_task_list(before, &after) {
        warn!(warning = %warning, "task list contract violation");
        log.line(format!("task list warning: {warning}"));
    }
    for label in regressed_tasks(before, &after) {
        log.line(format!("task regressed: {label} no longer passes"));
    }
}
