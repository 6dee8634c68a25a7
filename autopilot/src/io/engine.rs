//! Reasoning-engine boundary.
//!
//! The [`ReasoningEngine`] trait decouples the session runner from the HTTP
//! backend (an OpenAI-compatible chat-completions endpoint, OpenRouter by
//! default). Tests use scripted engines that return predetermined turns.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::{Message, Role, ToolCall};
use crate::io::config::{AgentConfig, EngineSettings};

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Distinguishable failure kinds of an engine call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid engine response: {0}")]
    InvalidResponse(String),
    #[error("engine call cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited(_))
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Auth(body),
            429 => Self::RateLimited(body),
            500..=599 => Self::Transport(format!("server error {status}: {body}")),
            _ => Self::InvalidResponse(format!("unexpected status {status}: {body}")),
        }
    }
}

/// One request to the engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineRequest<'a> {
    pub system_prompt: &'a str,
    pub conversation_history: &'a [Message],
    pub model_identifier: &'a str,
    pub tool_schema: &'a [Value],
}

/// One assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    pub assistant_text: String,
    pub tool_calls: Vec<ToolCall>,
    /// False when the engine stopped mid-turn (output length cap) and more
    /// output is pending.
    pub is_final_turn: bool,
}

/// Abstraction over reasoning-engine backends.
pub trait ReasoningEngine {
    /// Produce the next assistant turn. Must return [`EngineError::Cancelled`]
    /// promptly once `cancel` is raised.
    fn complete(
        &self,
        request: &EngineRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<EngineResponse, EngineError>;
}

/// Bounded retry with exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Call `engine`, retrying retryable failures per `policy`. The backoff sleep
/// is interruptible.
#[instrument(skip_all, fields(max_retries = policy.max_retries))]
pub fn complete_with_retry<E: ReasoningEngine + ?Sized>(
    engine: &E,
    request: &EngineRequest<'_>,
    policy: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<EngineResponse, EngineError> {
    let mut attempt = 0u32;
    loop {
        match engine.complete(request, cancel) {
            Ok(response) => return Ok(response),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                attempt += 1;
                warn!(err = %err, attempt, delay_ms = delay.as_millis() as u64, "engine call failed, retrying");
                if cancel.sleep(delay) {
                    return Err(EngineError::Cancelled);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Chat-completions client (OpenRouter or any OpenAI-compatible endpoint).
#[derive(Debug, Clone)]
pub struct OpenRouterEngine {
    client: Client,
    endpoint: String,
    api_key: SecretString,
    extra_options: BTreeMap<String, Value>,
}

impl OpenRouterEngine {
    pub fn new(
        settings: &EngineSettings,
        api_key: SecretString,
        extra_options: BTreeMap<String, Value>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            api_key,
            extra_options,
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("engine requires an API key"))?;
        Self::new(
            &config.settings.engine,
            api_key,
            config.extra_options.clone(),
        )
    }
}

impl ReasoningEngine for OpenRouterEngine {
    #[instrument(skip_all, fields(model = request.model_identifier, messages = request.conversation_history.len()))]
    fn complete(
        &self,
        request: &EngineRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<EngineResponse, EngineError> {
        let body = request_body(request, &self.extra_options);
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();

        // The blocking call runs on a worker so cancellation stays observable;
        // a cancelled call's response is dropped.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = send(&client, &endpoint, &api_key, &body);
            if tx.send(result).is_err() {
                debug!("engine response arrived after cancellation");
            }
        });

        loop {
            if cancel.is_cancelled() {
                info!("engine call abandoned on cancellation");
                return Err(EngineError::Cancelled);
            }
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Transport(
                        "engine worker exited without a response".to_string(),
                    ));
                }
            }
        }
    }
}

fn send(
    client: &Client,
    endpoint: &str,
    api_key: &SecretString,
    body: &Value,
) -> Result<EngineResponse, EngineError> {
    let response = client
        .post(endpoint)
        .bearer_auth(api_key.expose_secret())
        .header("X-Title", "autopilot")
        .json(body)
        .send()
        .map_err(|err| EngineError::Transport(err.to_string()))?;
    let status = response.status().as_u16();
    let text = response
        .text()
        .map_err(|err| EngineError::Transport(err.to_string()))?;
    if !(200..300).contains(&status) {
        return Err(EngineError::from_status(status, text));
    }
    parse_completion(&text)
}

/// Build the chat-completions request body. Extra options never replace the
/// core fields.
pub fn request_body(request: &EngineRequest<'_>, extra_options: &BTreeMap<String, Value>) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(request.model_identifier));
    body.insert(
        "messages".to_string(),
        Value::Array(wire_messages(request.system_prompt, request.conversation_history)),
    );
    if !request.tool_schema.is_empty() {
        body.insert("tools".to_string(), Value::Array(request.tool_schema.to_vec()));
        body.insert("tool_choice".to_string(), json!("auto"));
    }
    for (key, value) in extra_options {
        if body.contains_key(key) {
            warn!(key = %key, "ignoring extra option that would replace a core request field");
            continue;
        }
        body.insert(key.clone(), value.clone());
    }
    Value::Object(body)
}

/// Convert the conversation into chat-completions messages.
pub fn wire_messages(system_prompt: &str, history: &[Message]) -> Vec<Value> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(json!({ "role": "system", "content": system_prompt }));
    for message in history {
        let wire = match message.role {
            Role::User => json!({ "role": "user", "content": message.content }),
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": message.content,
            }),
            Role::Assistant if message.tool_calls.is_empty() => {
                json!({ "role": "assistant", "content": message.content })
            }
            Role::Assistant => {
                let calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": call.name, "arguments": call.arguments },
                        })
                    })
                    .collect();
                let content = if message.content.is_empty() {
                    Value::Null
                } else {
                    json!(message.content)
                };
                json!({ "role": "assistant", "content": content, "tool_calls": calls })
            }
        };
        messages.push(wire);
    }
    messages
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Option<String>,
}

/// Parse a successful chat-completions body.
///
/// Some providers report failures inside a 200 response; those are classified
/// by their embedded status code.
pub fn parse_completion(text: &str) -> Result<EngineResponse, EngineError> {
    let body: CompletionBody = serde_json::from_str(text)
        .map_err(|err| EngineError::InvalidResponse(format!("malformed body: {err}")))?;
    if let Some(error) = body.error {
        return Err(match error.code.as_ref().and_then(Value::as_u64) {
            Some(code) => EngineError::from_status(code as u16, error.message),
            None => EngineError::InvalidResponse(error.message),
        });
    }
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::InvalidResponse("response has no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let id = call.id.unwrap_or_else(|| format!("call_{index}"));
            ToolCall::new(id, call.function.name, call.function.arguments.unwrap_or_default())
        })
        .collect();

    Ok(EngineResponse {
        assistant_text: choice.message.content.unwrap_or_default(),
        tool_calls,
        is_final_turn: choice.finish_reason.as_deref() != Some("length"),
    })
}
