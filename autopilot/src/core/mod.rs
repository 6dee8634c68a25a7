//! Deterministic, pure logic shared by the supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod command_policy;
pub mod nudge;
pub mod progress;
pub mod sandbox_path;
pub mod termination;
pub mod tool_schema;
pub mod types;
