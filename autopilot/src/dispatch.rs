//! Tool dispatcher: routes a parsed tool call to its handler and turns every
//! outcome, including failures, into a [`ToolCallResult`].
//!
//! The dispatcher owns the state that outlives a session: dev-server slots
//! and the lazily launched browser. It lives for the whole process and is
//! lent to each session in turn.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::command_policy::validate;
use crate::core::sandbox_path::display_relative;
use crate::core::termination::SessionState;
use crate::core::types::{ServerAction, ToolCall, ToolCallRequest, ToolCallResult};
use crate::io::browser::{BrowserLauncher, BrowserSession, save_screenshot};
use crate::io::config::AgentConfig;
use crate::io::dev_server::{DEFAULT_SLOT, DevServers};
use crate::io::fs_tools;
use crate::io::init::ProjectPaths;
use crate::io::process::{run_command_with_timeout, shell_command};

pub struct ToolDispatcher {
    servers: DevServers,
    launcher: Box<dyn BrowserLauncher>,
    browser: Option<Box<dyn BrowserSession>>,
    paths: ProjectPaths,
}

impl ToolDispatcher {
    pub fn new(root: &Path, launcher: Box<dyn BrowserLauncher>) -> Self {
        Self::with_servers(DevServers::new(root), launcher)
    }

    pub fn with_servers(servers: DevServers, launcher: Box<dyn BrowserLauncher>) -> Self {
        let paths = ProjectPaths::new(servers.root());
        Self {
            servers,
            launcher,
            browser: None,
            paths,
        }
    }

    pub fn servers_mut(&mut self) -> &mut DevServers {
        &mut self.servers
    }

    pub fn browser_open(&self) -> bool {
        self.browser.is_some()
    }

    /// Execute one tool call. Never fails: errors become `Error:` results.
    #[instrument(skip_all, fields(tool = %call.name, id = %call.id))]
    pub fn dispatch(
        &mut self,
        call: &ToolCall,
        config: &AgentConfig,
        state: &mut SessionState,
    ) -> ToolCallResult {
        let started = Instant::now();
        let outcome = self.route(&call.request, config, state);
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => {
                debug!(duration_ms, "tool call succeeded");
                ToolCallResult::success(&call.id, output, duration_ms)
            }
            Err(err) => {
                let message = format!("{err:#}");
                debug!(duration_ms, err = %message, "tool call failed");
                ToolCallResult::failure(&call.id, message, duration_ms)
            }
        }
    }

    fn route(
        &mut self,
        request: &ToolCallRequest,
        config: &AgentConfig,
        state: &mut SessionState,
    ) -> Result<String> {
        let root = config.working_directory.as_path();
        let limit = config.settings.output_limit_bytes;
        match request {
            ToolCallRequest::ReadFile { path } => fs_tools::read_file(root, path, limit),
            ToolCallRequest::WriteFile { path, content } => {
                let written = fs_tools::write_file(root, path, content)?;
                let message = format!("wrote {} bytes to {}", content.len(), written.display());
                state.record_write(written);
                Ok(message)
            }
            ToolCallRequest::ListDirectory { path } => fs_tools::list_directory(root, path),
            ToolCallRequest::BatchReadFiles { paths } => {
                fs_tools::batch_read_files(root, paths, limit)
            }
            ToolCallRequest::BatchListDirectories { paths } => {
                fs_tools::batch_list_directories(root, paths)
            }
            ToolCallRequest::RunCommand {
                command,
                timeout_secs,
            } => run_command(config, command, *timeout_secs),
            ToolCallRequest::ManageServer {
                action,
                command,
                port,
                slot,
            } => self.manage_server(
                config,
                *action,
                command.as_deref(),
                *port,
                slot.as_deref().unwrap_or(DEFAULT_SLOT),
            ),
            ToolCallRequest::BrowserNavigate { url } => self.browser_navigate(url),
            ToolCallRequest::BrowserScreenshot { path } => {
                let bytes = self.session()?.screenshot()?;
                let saved = save_screenshot(&self.paths.screenshots_dir, path.as_deref(), &bytes)?;
                Ok(format!(
                    "saved screenshot ({} bytes) to {}",
                    bytes.len(),
                    display_relative(root, &saved)
                ))
            }
            ToolCallRequest::BrowserClick { selector } => {
                self.session()?.click(selector)?;
                Ok(format!("clicked '{selector}'"))
            }
            ToolCallRequest::BrowserFill { selector, value } => {
                self.session()?.fill(selector, value)?;
                Ok(format!("filled '{selector}'"))
            }
            ToolCallRequest::BrowserEvaluate { script } => {
                let value = self.session()?.evaluate(script)?;
                Ok(serde_json::to_string_pretty(&value)?)
            }
            ToolCallRequest::BrowserClose {} => self.browser_close(),
            ToolCallRequest::Invalid { error, .. } => Err(anyhow!("{error}")),
        }
    }

    fn manage_server(
        &mut self,
        config: &AgentConfig,
        action: ServerAction,
        command: Option<&str>,
        port: Option<u16>,
        slot: &str,
    ) -> Result<String> {
        if let Some(command) = command
            && matches!(action, ServerAction::Start | ServerAction::Restart)
        {
            check_command(config, command)?;
        }
        match action {
            ServerAction::Start => {
                let command = command
                    .ok_or_else(|| anyhow!("'command' is required to start a server"))?;
                self.servers.start(slot, command, port)
            }
            ServerAction::Stop => self.servers.stop(slot),
            ServerAction::Restart => self.servers.restart(slot, command, port),
            ServerAction::Status => self.servers.status(slot),
        }
    }

    fn browser_navigate(&mut self, url: &str) -> Result<String> {
        if self.browser.is_none() {
            info!("launching browser");
            self.browser = Some(self.launcher.launch()?);
        }
        let title = self.session()?.navigate(url)?;
        Ok(format!("navigated to {url}\ntitle: {title}"))
    }

    fn browser_close(&mut self) -> Result<String> {
        let Some(mut session) = self.browser.take() else {
            return Ok("no browser open".to_string());
        };
        session.close()?;
        Ok("browser closed".to_string())
    }

    fn session(&mut self) -> Result<&mut Box<dyn BrowserSession>> {
        self.browser
            .as_mut()
            .ok_or_else(|| anyhow!("no browser open; call browser_navigate first"))
    }

    /// Release the browser and stop every dev server.
    pub fn shutdown(&mut self) {
        if let Some(mut session) = self.browser.take()
            && let Err(err) = session.close()
        {
            warn!(err = %format!("{err:#}"), "failed to close browser");
        }
        self.servers.stop_all();
    }
}

impl Drop for ToolDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_command(config: &AgentConfig, command: &str) -> Result<()> {
    if !config.sandbox_enabled {
        return Ok(());
    }
    let verdict = validate(command, &config.allowed_commands);
    if !verdict.allowed {
        info!(command, reason = %verdict.reason, "command denied");
        bail!("command denied: {}", verdict.reason);
    }
    Ok(())
}

fn run_command(config: &AgentConfig, command: &str, timeout_secs: Option<u64>) -> Result<String> {
    check_command(config, command)?;
    let timeout = timeout_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.settings.command_timeout());
    let cmd = shell_command(command, &config.working_directory);
    let output = run_command_with_timeout(cmd, timeout, config.settings.output_limit_bytes)?;
    let text = output.combined_text();
    if output.timed_out {
        bail!("command timed out after {}s\n{text}", timeout.as_secs());
    }
    if !output.status.success() {
        let code = output
            .status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        bail!("command exited with status {code}\n{text}");
    }
    if text.trim().is_empty() {
        Ok("(command completed with no output)".to_string())
    } else {
        Ok(text)
    }
}
