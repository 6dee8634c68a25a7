//! Stable exit codes for autopilot CLI commands.

/// Run completed (task list passing) or was cancelled cleanly.
pub const OK: i32 = 0;
/// Invalid configuration, sandbox root already claimed, or a denied `check-command`.
pub const INVALID: i32 = 1;
/// A session ended with an unrecoverable engine or runtime failure.
pub const FATAL: i32 = 2;
/// `--max-sessions` was reached before the task list passed.
pub const ITERATION_CAP: i32 = 3;
/// Second interrupt while an unwind was pending; partial side effects possible.
pub const FORCED: i32 = 130;
