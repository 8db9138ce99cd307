//! REST endpoint handlers.

use std::convert::Infallible;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chat_relay::relay::{CompletionRelay, EventStream};
use chat_relay::{ChatRequest, RelayError};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

/// Header carrying the caller's request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub relay: CompletionRelay,
}

/// Response body for POST /v1/requests/{id}/cancel.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// POST /v1/chat/completions
///
/// The body is forwarded upstream as-is. With `"stream": true` the response
/// is `text/event-stream`; otherwise it is the upstream completion JSON.
pub async fn post_chat_completions(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some(request) = ChatRequest::from_value(body) else {
        return detail_response(StatusCode::BAD_REQUEST, "request body must be a JSON object");
    };
    let request_id = request_id(&headers);
    debug!(
        "POST /v1/chat/completions: model={}, stream={}, request_id={}",
        request.model(),
        request.is_stream(),
        request_id.as_deref().unwrap_or("-")
    );

    if request.is_stream() {
        let mut events = app
            .relay
            .create_chat_completion_stream(request, request_id.as_deref());
        // Headers wait for the first event so an open failure keeps its status.
        let first = events.next().await;
        if let Some(Err(err)) = &first {
            return relay_error_response(err);
        }
        let events: EventStream = Box::pin(futures::stream::iter(first).chain(events));
        return (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(sse_frames(events)),
        )
            .into_response();
    }

    match app
        .relay
        .create_chat_completion(request, request_id.as_deref())
        .await
    {
        Ok(completion) => Json(completion).into_response(),
        Err(err) => relay_error_response(&err),
    }
}

/// POST /v1/requests/{id}/cancel
pub async fn post_cancel(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: app.relay.cancel_request(&id),
    })
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Frame relay events for the wire. An error becomes a final `error` event.
fn sse_frames(events: EventStream) -> impl Stream<Item = Result<String, Infallible>> + Send {
    events.map(|event| {
        Ok(match event {
            Ok(line) => format!("{line}\n\n"),
            Err(err) => format!("data: {}\n\n", error_frame(&err)),
        })
    })
}

fn error_frame(err: &RelayError) -> Value {
    json!({
        "error": {
            "message": err.message(),
            "type": err.category(),
            "code": err.status_code(),
        }
    })
}

fn relay_error_response(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    detail_response(status, &err.message())
}

fn detail_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({"detail": detail}))).into_response()
}
