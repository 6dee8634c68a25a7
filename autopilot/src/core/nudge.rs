//! Prompt nudges that push a session toward producing files.
//!
//! Nudges only add text to the next outgoing message. They never change when a
//! session ends.

use crate::core::types::ToolCallResult;

/// Tool-call counts at which a session with no written files is reminded.
pub const NO_WRITE_THRESHOLDS: [u32; 3] = [10, 20, 35];

/// Consecutive failed tool calls that trigger a change-of-approach reminder.
pub const ERROR_STREAK_THRESHOLD: u32 = 3;

/// A reminder to append to the next outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nudge {
    /// `level` is 1-based and indexes [`NO_WRITE_THRESHOLDS`].
    NoFilesWritten { level: usize, tool_calls: u32 },
    /// Sent once, after the first successful `write_file`.
    FirstWrite,
    ConsecutiveErrors { streak: u32 },
}

impl Nudge {
    pub fn message(&self) -> String {
        match self {
            Nudge::NoFilesWritten { level: 1, tool_calls } => format!(
                "Reminder: you have made {tool_calls} tool calls without writing any files. \
                 Exploration is useful, but start implementing: pick the next failing feature \
                 and write code with write_file."
            ),
            Nudge::NoFilesWritten { level: 2, tool_calls } => format!(
                "Important: {tool_calls} tool calls and still no files written. Stop reading \
                 and exploring. Write the implementation for one failing feature now."
            ),
            Nudge::NoFilesWritten { tool_calls, .. } => format!(
                "URGENT: {tool_calls} tool calls with zero files written. This session's budget \
                 is nearly spent. Your very next action must be a write_file call that makes \
                 concrete progress."
            ),
            Nudge::FirstWrite => "Good progress: your first file is written. Next step: start \
                 the app with manage_server (action \"start\"), verify the feature in the \
                 browser, then set its \"passes\" field to true in feature_list.json and commit \
                 with git."
                .to_string(),
            Nudge::ConsecutiveErrors { streak } => format!(
                "The last {streak} tool calls failed. Read the error messages carefully and \
                 change your approach instead of repeating the same call."
            ),
        }
    }
}

/// Tracks which nudges were already sent during one session.
#[derive(Debug, Clone, Default)]
pub struct NudgePolicy {
    no_write_level: usize,
    praised_first_write: bool,
    error_streak: u32,
}

impl NudgePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a dispatched result (only the `Error:` prefix counts as failure).
    pub fn record_result(&mut self, result: &ToolCallResult) {
        if result.is_error_signal() {
            self.error_streak += 1;
        } else {
            self.error_streak = 0;
        }
    }

    /// Nudges due after an exchange, in the order they should be appended.
    pub fn due(&mut self, tool_call_count: u32, files_written: usize) -> Vec<Nudge> {
        let mut nudges = Vec::new();

        if files_written == 0 {
            let level = NO_WRITE_THRESHOLDS
                .iter()
                .filter(|threshold| tool_call_count >= **threshold)
                .count();
            if level > self.no_write_level {
                self.no_write_level = level;
                nudges.push(Nudge::NoFilesWritten {
                    level,
                    tool_calls: tool_call_count,
                });
            }
        } else if !self.praised_first_write {
            self.praised_first_write = true;
            nudges.push(Nudge::FirstWrite);
        }

        if self.error_streak >= ERROR_STREAK_THRESHOLD {
            nudges.push(Nudge::ConsecutiveErrors {
                streak: self.error_streak,
            });
            self.error_streak = 0;
        }

        nudges
    }
}
