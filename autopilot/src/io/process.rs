//! Helpers for running child processes with timeouts and bounded output.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout and stderr as one tagged text block for the engine.
    pub fn combined_text(&self) -> String {
        let mut text = String::new();
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stdout.trim().is_empty() {
            text.push_str(stdout.trim_end());
            text.push('\n');
        }
        if self.stdout_truncated > 0 {
            text.push_str(&format!("[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        if !stderr.trim().is_empty() {
            text.push_str("[stderr]\n");
            text.push_str(stderr.trim_end());
            text.push('\n');
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!("[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }
}

/// Build a `sh -c` invocation rooted at `cwd`, detached into its own process
/// group so a terminal interrupt reaches only the supervisor.
pub fn shell_command(command_line: &str, cwd: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line).current_dir(cwd);
    detach_process_group(&mut cmd);
    cmd
}

#[cfg(unix)]
pub fn detach_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub fn detach_process_group(_cmd: &mut Command) {}

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// Both pipes are drained on their own threads while the child runs; at most
/// `output_limit_bytes` per stream is kept and the rest is counted and
/// discarded. On timeout the child's process group is killed.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawn command")?;
    debug!(pid = child.id(), "command spawned");

    let stdout = Capture::start(child.stdout.take(), output_limit_bytes)?;
    let stderr = Capture::start(child.stderr.take(), output_limit_bytes)?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!("command timed out, killing its process group");
            kill_tree(&mut child)?;
            (child.wait().context("reap killed command")?, true)
        }
    };

    let stdout = stdout.finish().context("collect stdout")?;
    let stderr = stderr.finish().context("collect stderr")?;
    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        timed_out,
    })
}

/// Kill the child's whole process group, falling back to the child alone.
fn kill_tree(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL).is_ok() {
            return Ok(());
        }
    }
    child.kill().context("kill command")
}

struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

/// A pipe being drained on a background thread.
struct Capture(thread::JoinHandle<io::Result<Captured>>);

impl Capture {
    fn start<R: Read + Send + 'static>(pipe: Option<R>, limit: usize) -> Result<Self> {
        let pipe = pipe.ok_or_else(|| anyhow!("child stream was not piped"))?;
        Ok(Self(thread::spawn(move || drain(pipe, limit))))
    }

    fn finish(self) -> Result<Captured> {
        self.0
            .join()
            .map_err(|_| anyhow!("output reader thread panicked"))?
            .context("read child output")
    }
}

fn drain<R: Read>(mut pipe: R, limit: usize) -> io::Result<Captured> {
    let mut bytes = Vec::new();
    (&mut pipe).take(limit as u64).read_to_end(&mut bytes)?;
    let dropped = io::copy(&mut pipe, &mut io::sink())? as usize;
    Ok(Captured { bytes, dropped })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Verifies both output streams are captured.
    #[test]
    fn captures_stdout_and_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("echo out; echo err >&2; exit 3", temp.path());
        let output = run_command_with_timeout(cmd, Duration::from_secs(10), 1024).expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert!(!output.timed_out);
        let text = output.combined_text();
        assert!(text.contains("out"));
        assert!(text.contains("[stderr]\nerr"));
    }

    #[test]
    fn runs_in_requested_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let cmd = shell_command("ls", temp.path());
        let output = run_command_with_timeout(cmd, Duration::from_secs(10), 1024).expect("run");
        assert!(String::from_utf8_lossy(&output.stdout).contains("marker.txt"));
    }

    /// Verifies output beyond the limit is dropped and counted.
    #[test]
    fn truncates_large_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = shell_command("printf '%0100d' 0", temp.path());
        let output = run_command_with_timeout(cmd, Duration::from_secs(10), 10).expect("run");
        assert_eq!(output.stdout.len(), 10);
        assert_eq!(output.stdout_truncated, 90);
        assert!(output.combined_text().contains("truncated 90 bytes"));
    }

    /// Verifies a command past its timeout is killed promptly.
    #[test]
    fn kills_on_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let started = Instant::now();
        let cmd = shell_command("sleep 5", temp.path());
        let output =
            run_command_with_timeout(cmd, Duration::from_millis(200), 1024).expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
