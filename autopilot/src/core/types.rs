//! Shared deterministic types for the supervisor core.
//!
//! These types define stable contracts between the engine boundary, the tool
//! dispatcher and the session runner. They do not depend on external state.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Names of every tool the dispatcher understands, in schema order.
pub const KNOWN_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "list_directory",
    "batch_read_files",
    "batch_list_directories",
    "run_command",
    "manage_server",
    "browser_navigate",
    "browser_screenshot",
    "browser_click",
    "browser_fill",
    "browser_evaluate",
    "browser_close",
];

/// Prefix carried by every failed tool output.
pub const ERROR_PREFIX: &str = "Error:";

/// Action requested from the dev-server tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerAction {
    Start,
    Stop,
    Restart,
    Status,
}

fn default_directory() -> String {
    ".".to_string()
}

/// Parsed tool-call request: a closed set of variants, one per tool.
///
/// Requests the engine produces with an unknown name or malformed parameters
/// become [`ToolCallRequest::Invalid`] instead of failing the parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "name", content = "parameters", rename_all = "snake_case")]
pub enum ToolCallRequest {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    ListDirectory {
        #[serde(default = "default_directory")]
        path: String,
    },
    BatchReadFiles {
        paths: Vec<String>,
    },
    BatchListDirectories {
        paths: Vec<String>,
    },
    RunCommand {
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    ManageServer {
        action: ServerAction,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        slot: Option<String>,
    },
    BrowserNavigate {
        url: String,
    },
    BrowserScreenshot {
        #[serde(default)]
        path: Option<String>,
    },
    BrowserClick {
        selector: String,
    },
    BrowserFill {
        selector: String,
        value: String,
    },
    BrowserEvaluate {
        script: String,
    },
    BrowserClose {},
    #[serde(skip_deserializing)]
    Invalid {
        name: String,
        error: String,
    },
}

impl ToolCallRequest {
    /// Parse a raw `(name, arguments-json)` pair from the engine.
    pub fn parse(name: &str, arguments: &str) -> Self {
        if !KNOWN_TOOLS.contains(&name) {
            return Self::Invalid {
                name: name.to_string(),
                error: format!("unknown tool '{name}'"),
            };
        }
        let parameters: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(arguments) {
                Ok(value) => value,
                Err(err) => {
                    return Self::Invalid {
                        name: name.to_string(),
                        error: format!("arguments are not valid JSON: {err}"),
                    };
                }
            }
        };
        serde_json::from_value(json!({ "name": name, "parameters": parameters })).unwrap_or_else(
            |err| Self::Invalid {
                name: name.to_string(),
                error: format!("invalid parameters for {name}: {err}"),
            },
        )
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::ListDirectory { .. } => "list_directory",
            Self::BatchReadFiles { .. } => "batch_read_files",
            Self::BatchListDirectories { .. } => "batch_list_directories",
            Self::RunCommand { .. } => "run_command",
            Self::ManageServer { .. } => "manage_server",
            Self::BrowserNavigate { .. } => "browser_navigate",
            Self::BrowserScreenshot { .. } => "browser_screenshot",
            Self::BrowserClick { .. } => "browser_click",
            Self::BrowserFill { .. } => "browser_fill",
            Self::BrowserEvaluate { .. } => "browser_evaluate",
            Self::BrowserClose {} => "browser_close",
            Self::Invalid { name, .. } => name,
        }
    }
}

/// One tool call as emitted by the engine: the wire id and raw arguments are
/// kept so the call can be echoed back in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub request: ToolCallRequest,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        let name = name.into();
        let arguments = arguments.into();
        let request = ToolCallRequest::parse(&name, &arguments);
        Self {
            id: id.into(),
            name,
            arguments,
            request,
        }
    }
}

/// Outcome of one dispatched tool call. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub success: bool,
    pub output: String,
    pub duration_ms: u64,
}

impl ToolCallResult {
    pub fn success(tool_call_id: impl Into<String>, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            output: output.into(),
            duration_ms,
        }
    }

    /// Failed result; the output always starts with [`ERROR_PREFIX`].
    pub fn failure(tool_call_id: impl Into<String>, message: impl AsRef<str>, duration_ms: u64) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            output: format!("{ERROR_PREFIX} {}", message.as_ref()),
            duration_ms,
        }
    }

    pub fn is_error_signal(&self) -> bool {
        self.output.starts_with(ERROR_PREFIX)
    }
}

/// Decision of the command validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub allowed: bool,
    pub reason: String,
}

impl ValidationVerdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One entry of a session's conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(result: &ToolCallResult) -> Self {
        Self {
            role: Role::Tool,
            content: result.output.clone(),
            tool_calls: Vec::new(),
            tool_call_id: Some(result.tool_call_id.clone()),
        }
    }
}

/// Which opening prompt a session receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// No task list yet: write it from the app spec and scaffold the project.
    Initializer,
    /// Continue implementing failing tasks.
    Coding,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializer => "initializer",
            Self::Coding => "coding",
        }
    }
}

/// Why a single session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    Completed,
    BudgetExhausted,
    IdleExhausted,
    FatalError,
    Cancelled,
}

impl SessionEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::BudgetExhausted => "budget_exhausted",
            Self::IdleExhausted => "idle_exhausted",
            Self::FatalError => "fatal_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the orchestrator stopped starting sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    IterationCap,
    FatalError,
    Cancelled,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::IterationCap => "iteration_cap",
            Self::FatalError => "fatal_error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed | Self::Cancelled => crate::exit_codes::OK,
            Self::FatalError => crate::exit_codes::FATAL,
            Self::IterationCap => crate::exit_codes::ITERATION_CAP,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies a known tool call parses into its typed request.
    #[test]
    fn parse_known_tool_with_parameters() {
        let request = ToolCallRequest::parse("write_file", r#"{"path":"a.txt","content":"hi"}"#);
        assert_eq!(
            request,
            ToolCallRequest::WriteFile {
                path: "a.txt".to_string(),
                content: "hi".to_string(),
            }
        );
        assert_eq!(request.name(), "write_file");
    }

    /// Verifies omitted optional parameters take their defaults.
    #[test]
    fn parse_defaults_optional_parameters() {
        assert_eq!(
            ToolCallRequest::parse("list_directory", ""),
            ToolCallRequest::ListDirectory {
                path: ".".to_string()
            }
        );
        assert_eq!(
            ToolCallRequest::parse("browser_close", "{}"),
            ToolCallRequest::BrowserClose {}
        );
        assert_eq!(
            ToolCallRequest::parse("manage_server", r#"{"action":"status"}"#),
            ToolCallRequest::ManageServer {
                action: ServerAction::Status,
                command: None,
                port: None,
                slot: None,
            }
        );
    }

    /// Verifies an unknown tool name becomes an invalid request, not an error.
    #[test]
    fn unknown_tool_is_reported_as_data() {
        let request = ToolCallRequest::parse("delete_everything", "{}");
        match request {
            ToolCallRequest::Invalid { name, error } => {
                assert_eq!(name, "delete_everything");
                assert!(error.contains("unknown tool"));
            }
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    /// Verifies unparseable arguments become an invalid request.
    #[test]
    fn malformed_arguments_are_reported_as_data() {
        let request = ToolCallRequest::parse("read_file", "{not json");
        assert!(matches!(request, ToolCallRequest::Invalid { .. }));

        let request = ToolCallRequest::parse("read_file", r#"{"file":"x"}"#);
        match request {
            ToolCallRequest::Invalid { error, .. } => assert!(error.contains("invalid parameters")),
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    /// Verifies failed results start with `Error:`.
    #[test]
    fn failure_results_carry_error_prefix() {
        let result = ToolCallResult::failure("call-1", "boom", 3);
        assert!(!result.success);
        assert_eq!(result.output, "Error: boom");
        assert!(result.is_error_signal());

        let ok = ToolCallResult::success("call-2", "the word error appears here", 1);
        assert!(!ok.is_error_signal());
    }

    /// Verifies each stop reason has its own exit code.
    #[test]
    fn stop_reasons_map_to_distinct_exit_codes() {
        assert_eq!(StopReason::Completed.exit_code(), 0);
        assert_eq!(StopReason::Cancelled.exit_code(), 0);
        assert_ne!(StopReason::FatalError.exit_code(), 0);
        assert_ne!(StopReason::IterationCap.exit_code(), 0);
        assert_ne!(
            StopReason::FatalError.exit_code(),
            StopReason::IterationCap.exit_code()
        );
    }
}
