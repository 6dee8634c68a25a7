//! Long-lived dev-server processes, one per logical slot.
//!
//! Slots outlive individual sessions: a server started in one session keeps
//! running into the next. Every server runs in its own process group with its
//! output appended to `.autopilot/servers/<slot>.log`; stopping signals the
//! whole group so `npm run dev` style wrappers take their children down too.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::init::ProjectPaths;
use crate::io::process::shell_command;

pub const DEFAULT_SLOT: &str = "default";

const DEFAULT_STARTUP_WAIT: Duration = Duration::from_secs(3);
const STOP_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOG_TAIL_CHARS: usize = 1500;

static SLOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,32}$").expect("valid slot regex"));
static URL_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{2,5})").expect("valid url regex")
});
static WORD_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bport\s*:?\s*(\d{2,5})\b").expect("valid port regex"));
static CLI_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:--port[= ]|-p )(\d{2,5})\b").expect("valid flag regex"));

#[derive(Debug)]
struct ServerProcess {
    command: String,
    child: Child,
    log_path: PathBuf,
    port: Option<u16>,
    started_at: Instant,
}

/// Tracked dev servers keyed by slot name.
#[derive(Debug)]
pub struct DevServers {
    root: PathBuf,
    paths: ProjectPaths,
    slots: BTreeMap<String, ServerProcess>,
    startup_wait: Duration,
}

impl DevServers {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            paths: ProjectPaths::new(root),
            slots: BTreeMap::new(),
            startup_wait: DEFAULT_STARTUP_WAIT,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// How long `start` watches a new server for early exit or a port line.
    pub fn with_startup_wait(mut self, wait: Duration) -> Self {
        self.startup_wait = wait;
        self
    }

    /// Start `command` in `slot`. Idempotent: a running slot reports its
    /// status instead of spawning a duplicate.
    #[instrument(skip_all, fields(slot = %slot, command = %command))]
    pub fn start(&mut self, slot: &str, command: &str, port: Option<u16>) -> Result<String> {
        check_slot(slot)?;
        if self.is_running(slot) {
            let status = self.status(slot)?;
            return Ok(format!("server '{slot}' is already running\n{status}"));
        }
        self.slots.remove(slot);

        fs::create_dir_all(&self.paths.servers_dir)
            .with_context(|| format!("create {}", self.paths.servers_dir.display()))?;
        let log_path = self.paths.server_log_path(slot);
        let log = File::create(&log_path)
            .with_context(|| format!("create server log {}", log_path.display()))?;
        let log_err = log.try_clone().context("clone server log handle")?;

        let mut cmd = shell_command(command, &self.root);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn server command '{command}'"))?;
        let pid = child.id();
        info!(slot, pid, "dev server spawned");

        let mut server = ServerProcess {
            command: command.to_string(),
            child,
            log_path,
            port,
            started_at: Instant::now(),
        };

        let deadline = Instant::now() + self.startup_wait;
        while Instant::now() < deadline {
            if let Some(status) = server.child.try_wait().context("poll server")? {
                let tail = read_log_tail(&server.log_path);
                bail!("server '{slot}' exited during startup ({status})\n{tail}");
            }
            if server.port.is_none() && detect_port_in_text(&read_log(&server.log_path)).is_some() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        self.slots.insert(slot.to_string(), server);
        let status = self.status(slot)?;
        Ok(format!("started server '{slot}' (pid {pid})\n{status}"))
    }

    /// Stop the server in `slot`. Succeeds if it already exited or never ran.
    #[instrument(skip_all, fields(slot = %slot))]
    pub fn stop(&mut self, slot: &str) -> Result<String> {
        check_slot(slot)?;
        let Some(mut server) = self.slots.remove(slot) else {
            return Ok(format!("no server running in slot '{slot}'"));
        };
        if server.child.try_wait().context("poll server")?.is_some() {
            // The leader is gone but anything it backgrounded is still in its group.
            signal_group(&mut server.child, true);
            return Ok(format!("server '{slot}' had already exited"));
        }
        terminate(&mut server.child)?;
        info!(slot, "dev server stopped");
        Ok(format!("stopped server '{slot}'"))
    }

    /// Stop then start. Without `command`, reuses the slot's last command.
    pub fn restart(&mut self, slot: &str, command: Option<&str>, port: Option<u16>) -> Result<String> {
        check_slot(slot)?;
        let previous = self.slots.get(slot).map(|s| (s.command.clone(), s.port));
        let (command, port) = match (command, previous) {
            (Some(command), previous) => (
                command.to_string(),
                port.or(previous.and_then(|(_, port)| port)),
            ),
            (None, Some((command, previous_port))) => (command, port.or(previous_port)),
            (None, None) => bail!("no command known for slot '{slot}'; pass 'command'"),
        };
        let stopped = self.stop(slot)?;
        let started = self.start(slot, &command, port)?;
        Ok(format!("{stopped}\n{started}"))
    }

    /// Report whether `slot` is running and which port it listens on.
    pub fn status(&mut self, slot: &str) -> Result<String> {
        check_slot(slot)?;
        let Some(server) = self.slots.get_mut(slot) else {
            let port = detect_port_in_config(&self.root);
            return Ok(match port {
                Some(port) => format!(
                    "server '{slot}' is not running (project config suggests port {port})"
                ),
                None => format!("server '{slot}' is not running"),
            });
        };
        if let Some(status) = server.child.try_wait().context("poll server")? {
            let tail = read_log_tail(&server.log_path);
            return Ok(format!("server '{slot}' exited ({status})\n{tail}"));
        }
        let port = server
            .port
            .or_else(|| detect_port_in_text(&read_log(&server.log_path)))
            .or_else(|| detect_port_in_config(&self.root));
        let port_line = match port {
            Some(port) => format!("port: {port} (http://localhost:{port})"),
            None => "port: unknown (check the server log)".to_string(),
        };
        Ok(format!(
            "server '{slot}' running (pid {}, up {}s): {}\n{port_line}\nlog: {}",
            server.child.id(),
            server.started_at.elapsed().as_secs(),
            server.command,
            server.log_path.display()
        ))
    }

    pub fn is_running(&mut self, slot: &str) -> bool {
        self.slots
            .get_mut(slot)
            .is_some_and(|server| matches!(server.child.try_wait(), Ok(None)))
    }

    /// Names of slots with a tracked process (running or not yet reaped).
    pub fn slots(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    /// Stop every tracked server; failures are logged.
    pub fn stop_all(&mut self) {
        for slot in self.slots() {
            if let Err(err) = self.stop(&slot) {
                warn!(slot = %slot, err = %format!("{err:#}"), "failed to stop dev server");
            }
        }
    }
}

impl Drop for DevServers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn check_slot(slot: &str) -> Result<()> {
    if SLOT_RE.is_match(slot) {
        Ok(())
    } else {
        Err(anyhow!(
            "invalid slot name '{slot}' (use letters, digits, '-' or '_')"
        ))
    }
}

/// SIGTERM the process group, then SIGKILL after a grace period.
fn terminate(child: &mut Child) -> Result<()> {
    signal_group(child, false);
    if child
        .wait_timeout(STOP_GRACE)
        .context("wait for server to stop")?
        .is_some()
    {
        return Ok(());
    }
    warn!(pid = child.id(), "server ignored SIGTERM, killing");
    signal_group(child, true);
    child.wait().context("wait for killed server")?;
    Ok(())
}

#[cfg(unix)]
fn signal_group(child: &mut Child, force: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(err) = killpg(Pid::from_raw(child.id() as i32), signal) {
        debug!(err = %err, "killpg failed, signalling child only");
        if let Err(err) = child.kill() {
            debug!(err = %err, "kill failed");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _force: bool) {
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill failed");
    }
}

fn read_log(path: &Path) -> String {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn read_log_tail(path: &Path) -> String {
    let text = read_log(path);
    let count = text.chars().count();
    let tail: String = text.chars().skip(count.saturating_sub(LOG_TAIL_CHARS)).collect();
    if tail.trim().is_empty() {
        "(no output)".to_string()
    } else {
        format!("log tail:\n{}", tail.trim_end())
    }
}

/// Find a listening port announced in server output.
///
/// URL-style mentions (`http://localhost:5173`) win over bare `port 3000`
/// mentions; the latest announcement wins within each kind.
pub fn detect_port_in_text(text: &str) -> Option<u16> {
    let last = |re: &Regex| {
        re.captures_iter(text)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
            .last()
    };
    last(&URL_PORT_RE).or_else(|| last(&WORD_PORT_RE))
}

/// Find a configured port in well-known project files.
pub fn detect_port_in_config(root: &Path) -> Option<u16> {
    for name in ["vite.config.js", "vite.config.ts", "vite.config.mjs"] {
        let Ok(text) = fs::read_to_string(root.join(name)) else {
            continue;
        };
        if let Some(port) = WORD_PORT_RE
            .captures(&text)
            .and_then(|caps| caps.get(1)?.as_str().parse().ok())
        {
            return Some(port);
        }
    }
    let text = fs::read_to_string(root.join("package.json")).ok()?;
    let package: serde_json::Value = serde_json::from_str(&text).ok()?;
    let scripts = package.get("scripts")?.as_object()?;
    ["dev", "start", "serve"].iter().find_map(|name| {
        let script = scripts.get(*name)?.as_str()?;
        CLI_PORT_RE
            .captures(script)
            .and_then(|caps| caps.get(1)?.as_str().parse().ok())
    })
}
