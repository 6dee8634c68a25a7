//! Per-session state and the rule that decides when a session ends.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::core::progress::ProgressSnapshot;
use crate::core::types::{Message, SessionEndReason};

/// Consecutive idle turns after which a session gives up.
pub const IDLE_LIMIT: u32 = 2;

/// Consecutive length-truncated turns without tool calls after which a
/// session gives up.
pub const TRUNCATION_LIMIT: u32 = 3;

/// Tool-less exchanges since the last tool call, split by how the turn ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Streaks {
    /// Final turns with no tool calls.
    pub idle: u32,
    /// Turns cut off by the output cap with no tool calls.
    pub truncated: u32,
}

impl Streaks {
    pub fn record_tool_less(&mut self, is_final_turn: bool) {
        if is_final_turn {
            self.idle += 1;
        } else {
            self.truncated += 1;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn exhausted(&self) -> bool {
        self.idle >= IDLE_LIMIT || self.truncated >= TRUNCATION_LIMIT
    }
}

/// Mutable state owned by exactly one session. Never reused across sessions.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub tool_call_count: u32,
    pub files_written: BTreeSet<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub conversation_history: Vec<Message>,
}

impl SessionState {
    pub fn new(initial_message: Message) -> Self {
        Self {
            tool_call_count: 0,
            files_written: BTreeSet::new(),
            started_at: Utc::now(),
            conversation_history: vec![initial_message],
        }
    }

    pub fn record_write(&mut self, path: PathBuf) {
        self.files_written.insert(path);
    }
}

/// Decide whether the session ends after an exchange. First match wins:
/// budget, then task-list completion, then repeated tool-less turns.
pub fn check_termination(
    tool_call_count: u32,
    max_tool_calls: u32,
    progress: &ProgressSnapshot,
    streaks: Streaks,
) -> Option<SessionEndReason> {
    if tool_call_count >= max_tool_calls {
        return Some(SessionEndReason::BudgetExhausted);
    }
    if progress.is_complete() {
        return Some(SessionEndReason::Completed);
    }
    if streaks.exhausted() {
        return Some(SessionEndReason::IdleExhausted);
    }
    None
}
