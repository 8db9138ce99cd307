//! End-to-end tests of the reqwest transport against a fake upstream.
//!
//! A small axum app plays the OpenAI (and Azure OpenAI) API on a random port;
//! the relay talks to it through the real `OpenAiClient` and writes a real
//! TSV usage ledger.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chat_relay::api::RetryConfig;
use chat_relay::config::RelayConfig;
use chat_relay::relay::{CompletionRelay, DONE_EVENT, USAGE_COLUMNS};
use chat_relay::{ChatRequest, Message, RelayError, completion_text};
use futures::StreamExt;
use serde_json::{Value, json};

const API_KEY: &str = "sk-test";

// ── Fake upstream ───────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Fake {
    /// Every request body received, in order.
    bodies: Arc<Mutex<Vec<Value>>>,
    /// Paths (with query) of every request received.
    paths: Arc<Mutex<Vec<String>>>,
}

fn completion_body(model: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": model,
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}}],
        "usage": {
            "prompt_tokens": 21,
            "completion_tokens": 2,
            "prompt_tokens_details": {"cached_tokens": 8}
        }
    })
}

fn sse_body() -> String {
    let chunks = [
        json!({"choices": [{"index": 0, "delta": {"content": "po"}}], "usage": null}),
        json!({"choices": [{"index": 0, "delta": {"content": "ng"}}], "usage": null}),
        json!({"choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 2}}),
    ];
    let mut body = String::from(": keep-alive\n\n");
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn answer(body: &Value, authorized: bool) -> Response {
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"message": "Incorrect API key provided", "code": "invalid_api_key"}})),
        )
            .into_response();
    }
    let model = body["model"].as_str().unwrap_or_default();
    match model {
        "missing" => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"message": "The model `missing` does not exist"}})),
        )
            .into_response(),
        "limited" => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"message": "Rate limit reached", "code": "rate_limit_exceeded"}})),
        )
            .into_response(),
        _ if body["stream"] == json!(true) => {
            ([(header::CONTENT_TYPE, "text/event-stream")], sse_body()).into_response()
        }
        _ => Json(completion_body(model)).into_response(),
    }
}

async fn openai_completions(
    State(fake): State<Fake>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    fake.paths.lock().unwrap().push("/v1/chat/completions".into());
    fake.bodies.lock().unwrap().push(body.clone());
    let expected = format!("Bearer {API_KEY}");
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str());
    answer(&body, authorized)
}

async fn azure_completions(
    State(fake): State<Fake>,
    UrlPath(deployment): UrlPath<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let version = query.get("api-version").cloned().unwrap_or_default();
    fake.paths
        .lock()
        .unwrap()
        .push(format!("/openai/deployments/{deployment}?api-version={version}"));
    fake.bodies.lock().unwrap().push(body.clone());
    let authorized = headers.get("api-key").and_then(|v| v.to_str().ok()) == Some(API_KEY)
        && headers.get(header::AUTHORIZATION).is_none();
    answer(&body, authorized)
}

async fn spawn_fake() -> (String, Fake) {
    let fake = Fake::default();
    let app = Router::new()
        .route("/v1/chat/completions", post(openai_completions))
        .route(
            "/openai/deployments/{deployment}/chat/completions",
            post(azure_completions),
        )
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), fake)
}

// ── Helpers ─────────────────────────────────────────────────────────

fn relay(config: RelayConfig) -> CompletionRelay {
    CompletionRelay::from_config(&config.with_retry(RetryConfig::disabled())).unwrap()
}

fn request(model: &str) -> ChatRequest {
    ChatRequest::new(model).with_messages(&[Message::user("ping")])
}

/// Data rows of the ledger, split into fields (header checked and skipped).
fn ledger_rows(path: &Path) -> Vec<Vec<String>> {
    let content = std::fs::read_to_string(path).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next().unwrap(), USAGE_COLUMNS.join("\t"));
    lines
        .map(|l| l.split('\t').map(str::to_string).collect())
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn openai_completion_is_recorded() {
    let (base, fake) = spawn_fake().await;
    let dir = tempfile::tempdir().unwrap();
    let ledger = dir.path().join("usage.tsv");
    let relay = relay(
        RelayConfig::new(API_KEY)
            .with_base_url(format!("{base}/v1"))
            .with_usage_stats_path(&ledger),
    );

    let completion = relay
        .create_chat_completion(request("gpt-4o-mini"), Some("t-1"))
        .await
        .unwrap();
    assert_eq!(completion_text(&completion), Some("pong"));

    let sent = fake.bodies.lock().unwrap()[0].clone();
    assert!(sent.get("stream").is_none());
    assert_eq!(sent["messages"][0]["content"], "ping");

    let rows = ledger_rows(&ledger);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row[1], "t-1");
    assert_eq!(row[2], "False");
    assert_eq!(row[3], "gpt-4o-mini");
    assert_eq!(row[4], format!("{base}/v1"));
    assert_eq!(row[5], "openai");
    assert_eq!(&row[6..10], ["21", "2", "8", "23"]);
    assert_eq!(row[11], "success");
    assert_eq!(row[12], "");
}

#[tokio::test]
async fn openai_stream_requests_usage_and_records_it() {
    let (base, fake) = spawn_fake().await;
    let dir = tempfile::tempdir().unwrap();
    let ledger = dir.path().join("usage.tsv");
    let relay = relay(
        RelayConfig::new(API_KEY)
            .with_base_url(format!("{base}/v1"))
            .with_usage_stats_path(&ledger),
    );

    let events: Vec<String> = relay
        .create_chat_completion_stream(request("gpt-4o-mini"), None)
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(events.len(), 4);
    assert_eq!(events[3], DONE_EVENT);

    let sent = fake.bodies.lock().unwrap()[0].clone();
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["stream_options"]["include_usage"], true);

    let rows = ledger_rows(&ledger);
    assert_eq!(rows[0][2], "True");
    assert_eq!(&rows[0][6..10], ["9", "2", "0", "11"]);
}

#[tokio::test]
async fn azure_routes_by_deployment_with_api_key_header() {
    let (base, fake) = spawn_fake().await;
    let dir = tempfile::tempdir().unwrap();
    let ledger = dir.path().join("usage.tsv");
    let relay = relay(
        RelayConfig::new(API_KEY)
            .with_base_url(&base)
            .with_api_version("2024-06-01")
            .with_usage_stats_path(&ledger),
    );

    relay
        .create_chat_completion(request("my-deployment"), None)
        .await
        .unwrap();

    assert_eq!(
        fake.paths.lock().unwrap()[0],
        "/openai/deployments/my-deployment?api-version=2024-06-01"
    );
    assert_eq!(ledger_rows(&ledger)[0][5], "azure");
}

#[tokio::test]
async fn wrong_key_is_invalid_credentials() {
    let (base, _fake) = spawn_fake().await;
    let dir = tempfile::tempdir().unwrap();
    let ledger = dir.path().join("usage.tsv");
    let relay = relay(
        RelayConfig::new("sk-wrong")
            .with_base_url(format!("{base}/v1"))
            .with_usage_stats_path(&ledger),
    );

    let err = relay
        .create_chat_completion(request("gpt-4o-mini"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidCredentials { .. }));
    assert_eq!(err.status_code(), 401);
    assert_eq!(
        err.message(),
        "Invalid API key. Please check your OPENAI_API_KEY configuration."
    );

    let rows = ledger_rows(&ledger);
    assert_eq!(rows[0][11], "error");
    assert!(rows[0][12].starts_with("auth:HTTP 401"));
    assert_eq!(&rows[0][6..10], ["0", "0", "0", "0"]);
}

#[tokio::test]
async fn unknown_model_keeps_upstream_status() {
    let (base, _fake) = spawn_fake().await;
    let dir = tempfile::tempdir().unwrap();
    let relay = relay(
        RelayConfig::new(API_KEY)
            .with_base_url(format!("{base}/v1"))
            .with_usage_stats_path(dir.path().join("usage.tsv")),
    );

    let err = relay
        .create_chat_completion(request("missing"), None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert_eq!(
        err.message(),
        "Model not found. Please check your BIG_MODEL and SMALL_MODEL configuration."
    );
}

#[tokio::test]
async fn rate_limit_without_retries_is_sent_once() {
    let (base, fake) = spawn_fake().await;
    let dir = tempfile::tempdir().unwrap();
    let relay = relay(
        RelayConfig::new(API_KEY)
            .with_base_url(format!("{base}/v1"))
            .with_usage_stats_path(dir.path().join("usage.tsv")),
    );

    let err = relay
        .create_chat_completion_stream(request("limited"), Some("t-2"))
        .next()
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
    assert_eq!(fake.bodies.lock().unwrap().len(), 1);
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn rate_limit_is_retried_when_enabled() {
    let (base, fake) = spawn_fake().await;
    let dir = tempfile::tempdir().unwrap();
    let retry = RetryConfig {
        max_retries: 2,
        initial_delay: std::time::Duration::from_millis(5),
        jitter: false,
        ..Default::default()
    };
    let config = RelayConfig::new(API_KEY)
        .with_base_url(format!("{base}/v1"))
        .with_usage_stats_path(dir.path().join("usage.tsv"))
        .with_retry(retry);
    let relay = CompletionRelay::from_config(&config).unwrap();

    let err = relay
        .create_chat_completion(request("limited"), None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
    assert_eq!(fake.bodies.lock().unwrap().len(), 3);
}
