use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::channel::mpsc;
use serde_json::{Value, json};
use tokio::sync::Notify;

use super::*;
use crate::api::{Chunk, ChunkStream, UpstreamFuture};

// ── Scripted upstream ──────────────────────────────────────────────

enum Reply {
    Complete(Value),
    Fail(UpstreamError),
    /// Never resolves; the call can only end by cancellation.
    Hang,
    Chunks(Vec<Result<Chunk, UpstreamError>>),
    /// Chunks are fed by the test through the sender.
    Channel(mpsc::UnboundedReceiver<Result<Chunk, UpstreamError>>),
}

#[derive(Default)]
struct ScriptedUpstream {
    replies: Mutex<Vec<Reply>>,
    seen: Mutex<Vec<ChatRequest>>,
    started: Notify,
}

impl ScriptedUpstream {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies),
            ..Default::default()
        })
    }

    fn next_reply(&self, request: ChatRequest) -> Reply {
        self.seen.lock().unwrap().push(request);
        self.started.notify_one();
        let mut replies = self.replies.lock().unwrap();
        assert!(!replies.is_empty(), "unexpected upstream call");
        replies.remove(0)
    }
}

impl Upstream for ScriptedUpstream {
    fn send(&self, request: ChatRequest) -> UpstreamFuture<'_, Completion> {
        let reply = self.next_reply(request);
        Box::pin(async move {
            match reply {
                Reply::Complete(v) => Ok(v),
                Reply::Fail(e) => Err(e),
                Reply::Hang => std::future::pending().await,
                _ => panic!("streaming reply for non-streaming call"),
            }
        })
    }

    fn send_streaming(&self, request: ChatRequest) -> UpstreamFuture<'_, ChunkStream> {
        let reply = self.next_reply(request);
        Box::pin(async move {
            match reply {
                Reply::Chunks(items) => Ok(futures::stream::iter(items).boxed()),
                Reply::Channel(rx) => Ok(rx.boxed()),
                Reply::Fail(e) => Err(e),
                _ => panic!("non-streaming reply for streaming call"),
            }
        })
    }

    fn base_url(&self) -> &str {
        "https://upstream.test/v1"
    }

    fn api_type(&self) -> ApiType {
        ApiType::OpenAi
    }
}

fn relay_with(upstream: Arc<ScriptedUpstream>) -> (CompletionRelay, Arc<MemoryUsageSink>) {
    let sink = Arc::new(MemoryUsageSink::new());
    let relay = CompletionRelay::new(upstream, sink.clone());
    (relay, sink)
}

fn request() -> ChatRequest {
    ChatRequest::new("gpt-4o-mini").with_messages(&[crate::Message::user("hi")])
}

fn chunk(text: &str) -> Chunk {
    json!({"choices": [{"delta": {"content": text}}], "usage": null})
}

fn usage_chunk(input: u64, output: u64) -> Chunk {
    json!({
        "choices": [],
        "usage": {"prompt_tokens": input, "completion_tokens": output}
    })
}

async fn collect(mut events: EventStream) -> Vec<Result<String, RelayError>> {
    let mut out = Vec::new();
    while let Some(event) = events.next().await {
        out.push(event);
    }
    out
}

// ── Non-streaming ──────────────────────────────────────────────────

#[tokio::test]
async fn completion_success_records_usage() {
    let upstream = ScriptedUpstream::new(vec![Reply::Complete(json!({
        "choices": [{"message": {"content": "hello"}}],
        "usage": {
            "prompt_tokens": 12,
            "completion_tokens": 3,
            "prompt_tokens_details": {"cached_tokens": 4}
        }
    }))]);
    let (relay, sink) = relay_with(upstream);

    let completion = relay
        .create_chat_completion(request(), Some("req-1"))
        .await
        .unwrap();
    assert_eq!(crate::completion_text(&completion), Some("hello"));

    let records = sink.records();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.status, UsageStatus::Success);
    assert_eq!(r.request_id, "req-1");
    assert!(!r.is_stream);
    assert_eq!(r.model, "gpt-4o-mini");
    assert_eq!(r.base_url, "https://upstream.test/v1");
    assert_eq!(r.usage.input_tokens, 12);
    assert_eq!(r.usage.output_tokens, 3);
    assert_eq!(r.usage.cached_input_tokens, 4);
    assert_eq!(r.usage.total(), 15);
    assert_eq!(r.error, "");
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn completion_without_usage_counts_zero() {
    let upstream = ScriptedUpstream::new(vec![Reply::Complete(json!({"choices": []}))]);
    let (relay, sink) = relay_with(upstream);

    relay.create_chat_completion(request(), None).await.unwrap();
    let records = sink.records();
    let r = &records[0];
    assert_eq!(r.usage, TokenUsage::default());
    assert_eq!(r.request_id, "");
}

#[tokio::test]
async fn rate_limit_is_classified_and_recorded() {
    let upstream = ScriptedUpstream::new(vec![Reply::Fail(UpstreamError::RateLimit(
        "HTTP 429: rate_limit_exceeded".into(),
    ))]);
    let (relay, sink) = relay_with(upstream);

    let err = relay
        .create_chat_completion(request(), Some("req-1"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
    assert_eq!(err.message(), ErrorHint::RateLimited.message());

    let records = sink.records();
    let r = &records[0];
    assert_eq!(r.status, UsageStatus::Error);
    assert_eq!(r.usage, TokenUsage::default());
    assert_eq!(r.error, "ratelimit:HTTP 429: rate_limit_exceeded");
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn generic_api_error_keeps_upstream_status() {
    let upstream = ScriptedUpstream::new(vec![Reply::Fail(UpstreamError::Api {
        status: Some(503),
        message: "HTTP 503: overloaded".into(),
    })]);
    let (relay, sink) = relay_with(upstream);

    let err = relay.create_chat_completion(request(), None).await.unwrap_err();
    assert_eq!(err.status_code(), 503);
    assert_eq!(err.message(), "HTTP 503: overloaded");
    assert_eq!(sink.records()[0].error, "api:HTTP 503: overloaded");
}

#[tokio::test]
async fn cancel_mid_flight_returns_499() {
    let upstream = ScriptedUpstream::new(vec![Reply::Hang]);
    let (relay, sink) = relay_with(upstream.clone());

    let call = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.create_chat_completion(request(), Some("req-9")).await })
    };

    upstream.started.notified().await;
    assert!(relay.cancel_request("req-9"));

    let err = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("cancellation should end the call")
        .unwrap()
        .unwrap_err();
    assert_eq!(err, RelayError::CancelledByCaller);
    assert_eq!(err.status_code(), 499);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, UsageStatus::Error);
    assert_eq!(records[0].error, "cancelled:Request cancelled by client");
    assert!(relay.registry().is_empty());
    assert!(!relay.cancel_request("req-9"));
}

#[tokio::test]
async fn cancel_unknown_id_is_false() {
    let (relay, sink) = relay_with(ScriptedUpstream::new(vec![]));
    assert!(!relay.cancel_request("nope"));
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn id_reusable_after_completion() {
    let upstream = ScriptedUpstream::new(vec![
        Reply::Complete(json!({"choices": []})),
        Reply::Complete(json!({"choices": []})),
    ]);
    let (relay, sink) = relay_with(upstream);

    relay.create_chat_completion(request(), Some("same")).await.unwrap();
    relay.create_chat_completion(request(), Some("same")).await.unwrap();
    assert_eq!(sink.records().len(), 2);
    assert!(sink.records().iter().all(|r| r.status == UsageStatus::Success));
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn dropped_call_records_abort() {
    let upstream = ScriptedUpstream::new(vec![Reply::Hang]);
    let (relay, sink) = relay_with(upstream);

    let result = tokio::time::timeout(
        Duration::from_millis(20),
        relay.create_chat_completion(request(), Some("gone")),
    )
    .await;
    assert!(result.is_err());

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].error.starts_with("aborted:"));
    assert!(relay.registry().is_empty());
}

// ── Streaming ──────────────────────────────────────────────────────

#[tokio::test]
async fn stream_emits_chunks_then_done() {
    let upstream = ScriptedUpstream::new(vec![Reply::Chunks(vec![
        Ok(chunk("Hel")),
        Ok(chunk("lo")),
        Ok(usage_chunk(10, 5)),
    ])]);
    let (relay, sink) = relay_with(upstream.clone());

    let events = collect(relay.create_chat_completion_stream(request(), Some("s-1"))).await;
    let events: Vec<String> = events.into_iter().map(Result::unwrap).collect();

    assert_eq!(events.len(), 4);
    assert!(events[..3].iter().all(|e| e.starts_with("data: {")));
    assert_eq!(events[3], DONE_EVENT);
    let first: Value = serde_json::from_str(events[0].trim_start_matches("data: ")).unwrap();
    assert_eq!(crate::chunk_delta_text(&first), Some("Hel"));

    let records = sink.records();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert!(r.is_stream);
    assert_eq!(r.status, UsageStatus::Success);
    assert_eq!(r.usage.input_tokens, 10);
    assert_eq!(r.usage.output_tokens, 5);
    assert_eq!(r.usage.total(), 15);
    assert!(relay.registry().is_empty());

    let sent = upstream.seen.lock().unwrap();
    assert!(sent[0].is_stream());
    assert_eq!(sent[0].0["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn stream_usage_is_last_block_wins() {
    let upstream = ScriptedUpstream::new(vec![Reply::Chunks(vec![
        Ok(usage_chunk(1, 1)),
        Ok(chunk("x")),
        Ok(usage_chunk(7, 2)),
    ])]);
    let (relay, sink) = relay_with(upstream);

    collect(relay.create_chat_completion_stream(request(), None)).await;
    let records = sink.records();
    let r = &records[0];
    assert_eq!((r.usage.input_tokens, r.usage.output_tokens), (7, 2));
}

#[tokio::test]
async fn stream_empty_usage_block_keeps_previous_counts() {
    let upstream = ScriptedUpstream::new(vec![Reply::Chunks(vec![
        Ok(usage_chunk(10, 5)),
        Ok(json!({"choices": [], "usage": {}})),
    ])]);
    let (relay, sink) = relay_with(upstream);

    let events = collect(relay.create_chat_completion_stream(request(), None)).await;
    assert_eq!(events.len(), 3);
    let records = sink.records();
    let r = &records[0];
    assert_eq!(r.status, UsageStatus::Success);
    assert_eq!((r.usage.input_tokens, r.usage.output_tokens), (10, 5));
}

#[tokio::test]
async fn stream_cancelled_between_chunks() {
    let (tx, rx) = mpsc::unbounded();
    let upstream = ScriptedUpstream::new(vec![Reply::Channel(rx)]);
    let (relay, sink) = relay_with(upstream);

    let mut events = relay.create_chat_completion_stream(request(), Some("s-2"));
    assert!(relay.registry().is_registered("s-2"));

    tx.unbounded_send(Ok(chunk("a"))).unwrap();
    let first = events.next().await.unwrap().unwrap();
    assert!(first.starts_with("data: "));

    assert!(relay.cancel_request("s-2"));
    tx.unbounded_send(Ok(chunk("b"))).unwrap();

    let err = events.next().await.unwrap().unwrap_err();
    assert_eq!(err, RelayError::CancelledByCaller);
    assert!(events.next().await.is_none());

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_stream);
    assert_eq!(records[0].error, "cancelled:Request cancelled by client");
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn stream_open_failure_has_no_done() {
    let upstream = ScriptedUpstream::new(vec![Reply::Fail(UpstreamError::Authentication(
        "HTTP 401: invalid_api_key".into(),
    ))]);
    let (relay, sink) = relay_with(upstream);

    let events = collect(relay.create_chat_completion_stream(request(), Some("s-3"))).await;
    assert_eq!(events.len(), 1);
    let err = events[0].clone().unwrap_err();
    assert_eq!(err.status_code(), 401);
    assert_eq!(err.message(), ErrorHint::InvalidCredentials.message());

    let records = sink.records();
    let r = &records[0];
    assert!(r.is_stream);
    assert_eq!(r.error, "auth:HTTP 401: invalid_api_key");
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn stream_mid_failure_stops_after_error() {
    let upstream = ScriptedUpstream::new(vec![Reply::Chunks(vec![
        Ok(chunk("a")),
        Err(UpstreamError::Api {
            status: None,
            message: "connection reset".into(),
        }),
        Ok(chunk("never")),
    ])]);
    let (relay, sink) = relay_with(upstream);

    let events = collect(relay.create_chat_completion_stream(request(), None)).await;
    assert_eq!(events.len(), 2);
    assert!(events[0].is_ok());
    assert_eq!(events[1].clone().unwrap_err().status_code(), 500);
    assert_eq!(sink.records()[0].error, "api:connection reset");
}

#[tokio::test]
async fn unpolled_stream_dropped_records_abort() {
    let (relay, sink) = relay_with(ScriptedUpstream::new(vec![]));

    let events = relay.create_chat_completion_stream(request(), Some("s-4"));
    assert!(relay.registry().is_registered("s-4"));
    drop(events);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_stream);
    assert!(records[0].error.starts_with("aborted:"));
    assert!(relay.registry().is_empty());
}
