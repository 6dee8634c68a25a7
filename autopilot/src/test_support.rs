//! Test-only doubles: a scripted reasoning engine, an in-memory browser and
//! a temporary project root with a ready-made [`AgentConfig`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use secrecy::SecretString;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::core::progress::Task;
use crate::core::types::ToolCall;
use crate::dispatch::ToolDispatcher;
use crate::io::browser::{BrowserLauncher, BrowserSession};
use crate::io::config::{AgentConfig, EnvSettings, FileConfig, Overrides};
use crate::io::dev_server::DevServers;
use crate::io::engine::{EngineError, EngineRequest, EngineResponse, ReasoningEngine};
use crate::io::prompt::PromptEngine;

/// One scripted engine turn.
pub struct ScriptedTurn {
    pub response: Result<EngineResponse, EngineError>,
    /// Raised when this turn is served, before the response is returned.
    pub cancel: Option<CancelToken>,
}

impl ScriptedTurn {
    pub fn respond(response: EngineResponse) -> Self {
        Self {
            response: Ok(response),
            cancel: None,
        }
    }

    pub fn fail(err: EngineError) -> Self {
        Self {
            response: Err(err),
            cancel: None,
        }
    }

    pub fn cancelling(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }
}

/// Replays queued turns; an exhausted script answers with idle final turns.
#[derive(Default)]
pub struct ScriptedEngine {
    turns: RefCell<VecDeque<ScriptedTurn>>,
    calls: Cell<u32>,
    history_lens: RefCell<Vec<usize>>,
    system_prompts: RefCell<Vec<String>>,
    openings: RefCell<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: RefCell::new(turns.into()),
            ..Self::default()
        }
    }

    /// Number of `complete` invocations served.
    pub fn calls(&self) -> u32 {
        self.calls.get()
    }

    /// Conversation length seen by each invocation.
    pub fn history_lens(&self) -> Vec<usize> {
        self.history_lens.borrow().clone()
    }

    pub fn system_prompts(&self) -> Vec<String> {
        self.system_prompts.borrow().clone()
    }

    /// Opening user message of every session that reached the engine.
    pub fn openings(&self) -> Vec<String> {
        self.openings.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.borrow().len()
    }
}

impl ReasoningEngine for ScriptedEngine {
    fn complete(
        &self,
        request: &EngineRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<EngineResponse, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.calls.set(self.calls.get() + 1);
        self.history_lens
            .borrow_mut()
            .push(request.conversation_history.len());
        self.system_prompts
            .borrow_mut()
            .push(request.system_prompt.to_string());
        if let [opening] = request.conversation_history {
            self.openings.borrow_mut().push(opening.content.clone());
        }
        let Some(turn) = self.turns.borrow_mut().pop_front() else {
            return Ok(idle_response());
        };
        if let Some(token) = turn.cancel {
            token.cancel();
        }
        turn.response
    }
}

/// A final turn without tool calls.
pub fn idle_response() -> EngineResponse {
    EngineResponse {
        assistant_text: "All done for now.".to_string(),
        tool_calls: Vec::new(),
        is_final_turn: true,
    }
}

/// A turn cut off by the output cap before any tool call.
pub fn truncated_response() -> EngineResponse {
    EngineResponse {
        assistant_text: "Let me think about the layout".to_string(),
        tool_calls: Vec::new(),
        is_final_turn: false,
    }
}

/// A turn calling each `(tool, arguments)` in order.
pub fn tool_response(calls: &[(&str, Value)]) -> EngineResponse {
    let tool_calls = calls
        .iter()
        .enumerate()
        .map(|(index, (name, args))| ToolCall::new(format!("call_{index}"), *name, args.to_string()))
        .collect();
    EngineResponse {
        assistant_text: String::new(),
        tool_calls,
        is_final_turn: true,
    }
}

/// A `write_file` call replacing the task list with `tasks`.
pub fn write_tasks_call(tasks: &[Task]) -> (&'static str, Value) {
    (
        "write_file",
        json!({ "path": "feature_list.json", "content": tasks_json(tasks) }),
    )
}

pub fn task(description: &str, passes: bool) -> Task {
    Task {
        id: None,
        category: Some("functional".to_string()),
        description: description.to_string(),
        steps: vec![format!("verify {description}")],
        passes,
    }
}

pub fn tasks_json(tasks: &[Task]) -> String {
    serde_json::to_string_pretty(tasks).unwrap_or_else(|_| "[]".to_string())
}

/// Shared record of what a [`FakeBrowser`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct BrowserEvents(Arc<Mutex<Vec<String>>>);

impl BrowserEvents {
    fn push(&self, event: String) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event);
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

/// Launcher producing [`FakeBrowser`] sessions.
#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    pub events: BrowserEvents,
}

impl BrowserLauncher for FakeLauncher {
    fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        self.events.push("launch".to_string());
        Ok(Box::new(FakeBrowser {
            events: self.events.clone(),
            url: None,
        }))
    }
}

/// In-memory browser. Selectors starting with `#missing` fail.
#[derive(Debug)]
pub struct FakeBrowser {
    events: BrowserEvents,
    url: Option<String>,
}

/// Minimal PNG signature returned by [`FakeBrowser::screenshot`].
pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake";

impl BrowserSession for FakeBrowser {
    fn navigate(&mut self, url: &str) -> Result<String> {
        self.events.push(format!("navigate {url}"));
        self.url = Some(url.to_string());
        Ok(format!("Page at {url}"))
    }

    fn screenshot(&mut self) -> Result<Vec<u8>> {
        self.events.push("screenshot".to_string());
        Ok(FAKE_PNG.to_vec())
    }

    fn click(&mut self, selector: &str) -> Result<()> {
        if selector.starts_with("#missing") {
            bail!("no element matches selector '{selector}'");
        }
        self.events.push(format!("click {selector}"));
        Ok(())
    }

    fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        if selector.starts_with("#missing") {
            bail!("no element matches selector '{selector}'");
        }
        self.events.push(format!("fill {selector}={value}"));
        Ok(())
    }

    fn evaluate(&mut self, script: &str) -> Result<Value> {
        self.events.push(format!("evaluate {script}"));
        Ok(json!({ "url": self.url, "script": script }))
    }

    fn close(&mut self) -> Result<()> {
        self.events.push("close".to_string());
        Ok(())
    }
}

/// Temporary project root.
pub struct TempProject {
    _dir: TempDir,
    root: PathBuf,
}

impl TempProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let root = dir.path().canonicalize().context("canonicalize temp dir")?;
        Ok(Self { _dir: dir, root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, relative: &str) -> Result<String> {
        let path = self.root.join(relative);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn write_tasks(&self, tasks: &[Task]) -> Result<PathBuf> {
        self.write("feature_list.json", &tasks_json(tasks))
    }

    /// Test settings: no inter-session delay, short command timeout, quiet log.
    pub fn settings(&self) -> FileConfig {
        FileConfig {
            session_delay_secs: 0,
            command_timeout_secs: 20,
            ..FileConfig::default()
        }
    }

    pub fn config(&self) -> Result<AgentConfig> {
        self.config_with(self.settings())
    }

    pub fn config_with(&self, settings: FileConfig) -> Result<AgentConfig> {
        let system_prompt = PromptEngine::new()?.render_base(&settings.allowed_commands)?;
        let env = EnvSettings {
            api_key: Some(SecretString::from("sk-test".to_string())),
            model: Some("test/model".to_string()),
        };
        Ok(AgentConfig::build(
            &self.root,
            settings,
            env,
            &Overrides::default(),
            system_prompt,
        )?)
    }

    /// Dispatcher backed by a [`FakeLauncher`] sharing `events`.
    pub fn dispatcher(&self, events: &BrowserEvents) -> ToolDispatcher {
        let servers = DevServers::new(&self.root).with_startup_wait(Duration::from_millis(300));
        ToolDispatcher::with_servers(
            servers,
            Box::new(FakeLauncher {
                events: events.clone(),
            }),
        )
    }
}
