use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use parking_lot::Mutex;
use polylogue::config::{parse_config, HttpConfig};
use polylogue::protocol::canonical::{
    GenerationControls, Message, ModelInfo, ProviderKind, ProviderOverrides, StopReason,
    StreamEvent, ToolCall, Usage,
};
use polylogue::transport::HttpTransport;
use polylogue::{Adapter, AdapterRegistry, EngineError, HttpAdapter, TurnRequest};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const ANTHROPIC_SSE: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_up\",\"usage\":{\"input_tokens\":21,\"output_tokens\":1}}}\n\n",
    "event: content_block_start\n",
    "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    "event: ping\n",
    "data: {\"type\":\"ping\"}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
    "event: content_block_stop\n",
    "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

const CHAT_SSE: &str = concat!(
    "data: {\"id\":\"chatcmpl-s\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"retried\"}}]}\n\n",
    "data: {\"id\":\"chatcmpl-s\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n",
);

#[derive(Default)]
struct Upstream {
    hits: AtomicUsize,
    bodies: Mutex<Vec<Value>>,
    headers: Mutex<Vec<HeaderMap>>,
}

impl Upstream {
    fn record(&self, headers: HeaderMap, body: Value) -> usize {
        self.headers.lock().push(headers);
        self.bodies.lock().push(body);
        self.hits.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn last_body(&self) -> Value {
        self.bodies.lock().last().cloned().expect("a recorded body")
    }

    fn last_headers(&self) -> HeaderMap {
        self.headers.lock().last().cloned().expect("recorded headers")
    }
}

fn sse(body: &'static str) -> Response {
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from(body))
        .expect("sse response")
}

fn json_response(status: StatusCode, body: Value) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("json response")
}

async fn messages_handler(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    upstream.record(headers, body);
    sse(ANTHROPIC_SSE)
}

async fn chat_handler(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let streaming = body["stream"] == json!(true);
    upstream.record(headers, body);
    if streaming {
        return sse(CHAT_SSE);
    }
    json_response(
        StatusCode::OK,
        json!({
            "id": "chatcmpl-9",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2}
        }),
    )
}

async fn flaky_chat_handler(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if upstream.record(headers, body) == 1 {
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("retry-after", "0")
            .body(Body::from("slow down"))
            .expect("429 response");
    }
    sse(CHAT_SSE)
}

async fn rejecting_chat_handler(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    upstream.record(headers, body);
    json_response(
        StatusCode::BAD_REQUEST,
        json!({"error": {"message": "bad param", "type": "invalid_request_error", "code": "bad_param"}}),
    )
}

async fn models_handler() -> Response {
    json_response(
        StatusCode::OK,
        json!({"object": "list", "data": [{"id": "gpt-a"}, {"id": "gpt-b", "display_name": "B"}]}),
    )
}

async fn denied_models_handler() -> Response {
    json_response(
        StatusCode::UNAUTHORIZED,
        json!({"type": "error", "error": {"type": "authentication_error", "message": "invalid x-api-key"}}),
    )
}

fn mock_app(upstream: Arc<Upstream>) -> Router {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/chat/completions", post(chat_handler))
        .route("/v1/models", get(models_handler))
        .route("/flaky/v1/chat/completions", post(flaky_chat_handler))
        .route("/rejecting/v1/chat/completions", post(rejecting_chat_handler))
        .route("/denied/v1/models", get(denied_models_handler))
        .with_state(upstream)
}

/// Serve the mock upstream and return its origin, e.g. `http://127.0.0.1:1234`.
async fn spawn_upstream() -> (String, Arc<Upstream>) {
    let upstream = Arc::new(Upstream::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock upstream addr");
    let app = mock_app(upstream.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), upstream)
}

fn adapter(kind: ProviderKind, base_url: String) -> HttpAdapter {
    let transport = HttpTransport::new(&HttpConfig::default()).expect("transport");
    HttpAdapter::new("mock", kind, base_url, "secret", Arc::new(transport))
}

fn interrupted_history() -> Vec<Message> {
    vec![
        Message::user("weather in Oslo?"),
        Message::assistant(Vec::new())
            .with_id("a1")
            .with_tool_calls(vec![ToolCall::new("c1", "weather", serde_json::Map::new())]),
        Message::user("never mind, say hello"),
    ]
}

#[tokio::test]
async fn anthropic_streaming_turn_repairs_history_and_decodes() {
    let (origin, upstream) = spawn_upstream().await;
    let adapter = adapter(ProviderKind::Anthropic, format!("{origin}/v1"))
        .with_default_max_tokens(2048);
    let history = interrupted_history();

    let events: Vec<StreamEvent> = adapter
        .send_message(TurnRequest::new(&history, "claude-test"))
        .await
        .expect("stream")
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            StreamEvent::MessageStart { id: "msg_up".to_string() },
            StreamEvent::text("Hel"),
            StreamEvent::text("lo"),
            StreamEvent::MessageEnd {
                usage: Some(Usage {
                    input_tokens: 21,
                    output_tokens: 2,
                    ..Usage::default()
                }),
                stop_reason: Some(StopReason::EndOfTurn),
            },
        ]
    );

    let headers = upstream.last_headers();
    assert_eq!(headers["x-api-key"], "secret");
    assert_eq!(headers["anthropic-version"], "2023-06-01");
    assert!(headers.get("authorization").is_none());

    let body = upstream.last_body();
    assert_eq!(body["model"], "claude-test");
    assert_eq!(body["max_tokens"], 2048);
    assert_eq!(body["stream"], true);
    let messages = body["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[2]["role"], "user");
    assert_eq!(messages[2]["content"][0]["type"], "tool_result");
    assert_eq!(messages[2]["content"][0]["tool_use_id"], "c1");
    // the caller's history is not modified
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn chat_non_streaming_turn_replays_as_events() {
    let (origin, upstream) = spawn_upstream().await;
    let adapter = adapter(ProviderKind::OpenAiChat, format!("{origin}/v1"));
    let history = vec![Message::system("be brief"), Message::user("hi")];
    let controls = GenerationControls {
        overrides: ProviderOverrides::from_pairs([
            ("metadata", json!({"user": "u1"})),
            ("service_tier", json!("flex")),
        ])
        .expect("overrides"),
        ..GenerationControls::default()
    };

    let events: Vec<StreamEvent> = adapter
        .send_message(
            TurnRequest::new(&history, "gpt-test")
                .with_controls(controls)
                .streaming(false),
        )
        .await
        .expect("stream")
        .collect()
        .await;

    assert_eq!(events[0], StreamEvent::MessageStart { id: "chatcmpl-9".to_string() });
    assert_eq!(events[1], StreamEvent::text("hi there"));
    assert_eq!(
        events[2],
        StreamEvent::MessageEnd {
            usage: Some(Usage {
                input_tokens: 3,
                output_tokens: 2,
                ..Usage::default()
            }),
            stop_reason: Some(StopReason::EndOfTurn),
        }
    );
    assert_eq!(events.len(), 3);

    assert_eq!(upstream.last_headers()["authorization"], "Bearer secret");
    let body = upstream.last_body();
    assert_eq!(body["metadata"], json!({"user": "u1"}));
    assert_eq!(body["service_tier"], "flex");
    assert!(body.get("stream").is_none());
    assert_eq!(body["messages"][0]["role"], "system");
}

#[tokio::test]
async fn retriable_status_is_retried_before_streaming() {
    let (origin, upstream) = spawn_upstream().await;
    let adapter = adapter(ProviderKind::OpenAiCompatible, format!("{origin}/flaky/v1"));
    let history = vec![Message::user("hi")];

    let events: Vec<StreamEvent> = adapter
        .send_message(TurnRequest::new(&history, "local-model"))
        .await
        .expect("stream")
        .collect()
        .await;

    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
    assert_eq!(events[1], StreamEvent::text("retried"));
    assert!(matches!(
        events.last(),
        Some(StreamEvent::MessageEnd {
            stop_reason: Some(StopReason::EndOfTurn),
            ..
        })
    ));
}

#[tokio::test]
async fn provider_error_body_becomes_terminal_error_item() {
    let (origin, upstream) = spawn_upstream().await;
    let adapter = adapter(ProviderKind::OpenAiChat, format!("{origin}/rejecting/v1"));
    let history = vec![Message::user("hi")];

    let events: Vec<StreamEvent> = adapter
        .send_message(TurnRequest::new(&history, "gpt-test"))
        .await
        .expect("failures after sending are stream items")
        .collect()
        .await;

    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        events,
        vec![StreamEvent::Error(EngineError::provider("bad_param", "bad param"))]
    );
}

#[tokio::test]
async fn unsendable_request_fails_without_any_http_call() {
    let (origin, upstream) = spawn_upstream().await;
    let adapter = adapter(ProviderKind::Anthropic, format!("{origin}/v1"));
    let history = vec![Message::system("nothing to answer")];

    let err = adapter
        .send_message(TurnRequest::new(&history, "claude-test"))
        .await
        .err()
        .expect("rejected before sending");

    assert!(matches!(err, EngineError::InvalidRequest(_)));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelled_turn_ends_silently_without_sending() {
    let (origin, upstream) = spawn_upstream().await;
    let adapter = adapter(ProviderKind::OpenAiChat, format!("{origin}/v1"));
    let history = vec![Message::user("hi")];
    let cancel = CancellationToken::new();
    cancel.cancel();

    let events: Vec<StreamEvent> = adapter
        .send_message(TurnRequest::new(&history, "gpt-test").with_cancel(cancel))
        .await
        .expect("stream")
        .collect()
        .await;

    assert!(events.is_empty());
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn model_listing_and_key_validation() {
    let (origin, _upstream) = spawn_upstream().await;

    let accepted = adapter(ProviderKind::OpenAiResponses, format!("{origin}/v1"));
    assert_eq!(
        accepted.fetch_available_models().await.expect("models"),
        vec![
            ModelInfo {
                id: "gpt-a".to_string(),
                display_name: None,
            },
            ModelInfo {
                id: "gpt-b".to_string(),
                display_name: Some("B".to_string()),
            },
        ]
    );
    assert!(accepted.validate_api_key().await.expect("validated"));

    let denied = adapter(ProviderKind::Anthropic, format!("{origin}/denied/v1"));
    assert!(!denied.validate_api_key().await.expect("rejection is not an error"));
}

#[tokio::test]
async fn registry_routes_models_to_configured_providers() {
    let (origin, upstream) = spawn_upstream().await;
    let yaml = format!(
        r"
providers:
  - name: claude
    provider: anthropic
    base_url: {origin}/v1
    api_key: secret
    models: [claude-test]
  - name: local
    provider: openai-compatible
    base_url: {origin}/v1
    api_key: secret
    is_default: true
    models: [llama]
"
    );
    let config = parse_config(&yaml).expect("config");
    let registry = AdapterRegistry::from_config(&config).expect("registry");
    assert_eq!(registry.resolve("claude-test").name(), "claude");
    assert_eq!(registry.resolve("unknown-model").name(), "local");

    let history = vec![Message::user("hi")];
    let events: Vec<StreamEvent> = registry
        .resolve("claude-test")
        .send_message(TurnRequest::new(&history, "claude-test"))
        .await
        .expect("stream")
        .collect()
        .await;
    assert!(events.last().is_some_and(StreamEvent::is_terminal));
    assert_eq!(upstream.last_body()["max_tokens"], 4096);
}
