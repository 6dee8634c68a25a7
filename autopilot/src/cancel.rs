//! Cooperative cancellation shared by the orchestrator, sessions and engine calls.
//!
//! The first interrupt only raises a flag; long-running work polls it at safe
//! checkpoints (between tool dispatches, while waiting on the engine, during the
//! inter-session delay). A second interrupt terminates the process immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::warn;

use crate::exit_codes;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Clonable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `true` if the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Register SIGINT/SIGTERM handling for `token`.
///
/// First signal: mark cancellation and let the run unwind at its next checkpoint.
/// Second signal: run `on_force`, then exit immediately with
/// [`exit_codes::FORCED`]. Destructors do not run on that path, so `on_force`
/// must release anything a later run would trip over.
pub fn install_interrupt_handler<F>(token: CancelToken, on_force: F) -> Result<()>
where
    F: Fn() + Send + 'static,
{
    let presses = AtomicU32::new(0);
    ctrlc::set_handler(move || {
        let count = presses.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            eprintln!(
                "\nInterrupt received: finishing the current step, then pausing. \
                 Press Ctrl+C again to force quit."
            );
            token.cancel();
        } else {
            warn!("second interrupt, forcing exit");
            on_force();
            eprintln!("\nForced exit; in-flight work may be incomplete.");
            std::process::exit(exit_codes::FORCED);
        }
    })
    .context("install interrupt handler")
}
