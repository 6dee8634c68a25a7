//! HTTP-level tests for the chat-completions client: request shape, status
//! classification and retry, against a local mock server.

use std::collections::BTreeMap;

use autopilot::cancel::CancelToken;
use autopilot::core::tool_schema::tool_definitions;
use autopilot::core::types::{Message, ToolCallRequest};
use autopilot::io::config::EngineSettings;
use autopilot::io::engine::{
    EngineError, EngineRequest, EngineResponse, OpenRouterEngine, ReasoningEngine, RetryPolicy,
    complete_with_retry,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::runtime::Runtime;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    server: MockServer,
    rt: Runtime,
}

impl Fixture {
    fn new() -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("runtime");
        let server = rt.block_on(MockServer::start());
        Self { server, rt }
    }

    fn mount(&self, mock: Mock) {
        self.rt.block_on(mock.mount(&self.server));
    }

    fn engine(&self, extras: BTreeMap<String, Value>) -> OpenRouterEngine {
        let settings = EngineSettings {
            base_url: self.server.uri(),
            request_timeout_secs: 10,
            ..EngineSettings::default()
        };
        OpenRouterEngine::new(&settings, SecretString::from("sk-test".to_string()), extras)
            .expect("engine")
    }
}

fn call(engine: &dyn ReasoningEngine) -> Result<EngineResponse, EngineError> {
    let history = vec![Message::user("Build the app.")];
    let tools = tool_definitions();
    let request = EngineRequest {
        system_prompt: "You are a coding agent.",
        conversation_history: &history,
        model_identifier: "test/model",
        tool_schema: &tools,
    };
    engine.complete(&request, &CancelToken::new())
}

fn completion(message: Value, finish_reason: &str) -> Value {
    json!({
        "id": "gen-1",
        "choices": [{ "index": 0, "message": message, "finish_reason": finish_reason }]
    })
}

fn status(code: u16, body: &str) -> Result<EngineResponse, EngineError> {
    let fixture = Fixture::new();
    fixture.mount(
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(code).set_body_string(body)),
    );
    call(&fixture.engine(BTreeMap::new()))
}

/// Verifies the request carries credentials, model, tools and extras.
///
/// The mock only answers a bearer-authenticated POST; the parsed response must
/// contain the scripted tool call.
#[test]
fn parses_tool_calls_and_sends_credentials() {
    let fixture = Fixture::new();
    fixture.mount(
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "test/model",
                "tool_choice": "auto",
                "temperature": 0.2,
                "messages": [
                    { "role": "system", "content": "You are a coding agent." },
                    { "role": "user", "content": "Build the app." }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                json!({
                    "role": "assistant",
                    "content": "Looking around first.",
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": { "name": "list_directory", "arguments": "{\"path\":\"src\"}" }
                    }]
                }),
                "tool_calls",
            ))),
    );
    let extras = BTreeMap::from([
        ("temperature".to_string(), json!(0.2)),
        ("model".to_string(), json!("ignored/model")),
    ]);

    let response = call(&fixture.engine(extras)).expect("response");

    assert_eq!(response.assistant_text, "Looking around first.");
    assert!(response.is_final_turn);
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].id, "call_abc");
    assert_eq!(
        response.tool_calls[0].request,
        ToolCallRequest::ListDirectory {
            path: "src".to_string()
        }
    );
}

/// Verifies `finish_reason: length` marks the turn as not final.
#[test]
fn length_cut_is_not_a_final_turn() {
    let fixture = Fixture::new();
    fixture.mount(
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                json!({ "role": "assistant", "content": "I will now" }),
                "length",
            ))),
    );

    let response = call(&fixture.engine(BTreeMap::new())).expect("response");

    assert!(!response.is_final_turn);
    assert!(response.tool_calls.is_empty());
}

/// Verifies 401 maps to an authentication error.
#[test]
fn unauthorized_is_an_auth_error() {
    let err = status(401, "invalid api key").expect_err("auth");
    assert!(matches!(err, EngineError::Auth(ref body) if body.contains("invalid api key")));
    assert!(!err.is_retryable());
}

/// Verifies 429 maps to a rate-limit error.
#[test]
fn too_many_requests_is_rate_limited() {
    let err = status(429, "slow down").expect_err("rate limit");
    assert!(matches!(err, EngineError::RateLimited(_)));
    assert!(err.is_retryable());
}

/// Verifies 5xx responses are retryable transport failures.
#[test]
fn server_errors_are_transport_failures() {
    let err = status(503, "upstream unavailable").expect_err("transport");
    assert!(matches!(err, EngineError::Transport(_)));
    assert!(err.is_retryable());
}

/// Verifies other client errors are invalid responses.
#[test]
fn other_statuses_are_invalid_responses() {
    let err = status(400, "bad request").expect_err("invalid");
    assert!(matches!(err, EngineError::InvalidResponse(_)));
    assert!(!err.is_retryable());
}

/// Verifies an error object in a 200 body is classified by its code.
#[test]
fn error_embedded_in_ok_body_is_classified() {
    let fixture = Fixture::new();
    fixture.mount(
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "code": 429, "message": "provider overloaded" }
        }))),
    );

    let err = call(&fixture.engine(BTreeMap::new())).expect_err("embedded error");

    assert!(matches!(err, EngineError::RateLimited(ref msg) if msg == "provider overloaded"));
}

/// Verifies connection failures are transport errors.
#[test]
fn unreachable_endpoint_is_a_transport_failure() {
    let settings = EngineSettings {
        base_url: "http://127.0.0.1:9".to_string(),
        request_timeout_secs: 5,
        ..EngineSettings::default()
    };
    let engine =
        OpenRouterEngine::new(&settings, SecretString::from("sk-test".to_string()), BTreeMap::new())
            .expect("engine");

    let err = call(&engine).expect_err("connection refused");

    assert!(matches!(err, EngineError::Transport(_)));
}

/// Verifies one 502 followed by success is absorbed by retry.
#[test]
fn retry_recovers_from_a_transient_failure() {
    let fixture = Fixture::new();
    fixture.mount(
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .up_to_n_times(1)
            .expect(1),
    );
    fixture.mount(
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200).set_body_json(
            completion(json!({ "role": "assistant", "content": "done" }), "stop"),
        )),
    );
    let engine = fixture.engine(BTreeMap::new());
    let history = vec![Message::user("Build the app.")];
    let request = EngineRequest {
        system_prompt: "sys",
        conversation_history: &history,
        model_identifier: "test/model",
        tool_schema: &[],
    };
    let policy = RetryPolicy {
        max_retries: 2,
        base_backoff: std::time::Duration::from_millis(5),
    };

    let response =
        complete_with_retry(&engine, &request, &policy, &CancelToken::new()).expect("response");

    assert_eq!(response.assistant_text, "done");
}
