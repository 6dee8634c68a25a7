//! I/O adapters used by the supervisor.

pub mod browser;
pub mod config;
pub mod dev_server;
pub mod engine;
pub mod fs_tools;
pub mod git;
pub mod init;
pub mod lock;
pub mod process;
pub mod progress_store;
pub mod prompt;
pub mod run_state;
pub mod session_log;
