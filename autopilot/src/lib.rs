//! Supervisor for long-running, multi-session coding agents.
//!
//! The crate drives repeated bounded sessions against a remote reasoning engine
//! until the project's task list passes, and gates every action the agent takes
//! through a command sandbox. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (command policy, path confinement,
//!   progress accounting, nudges, termination rules). No I/O.
//! - **[`io`]**: Side-effecting adapters (engine HTTP client, subprocesses, dev
//!   servers, browser driver, filesystem stores, logs).
//!
//! Orchestration modules ([`dispatch`], [`session`], [`orchestrator`]) combine
//! core decisions with I/O to implement the `autopilot run` command.

pub mod cancel;
pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
