//! Cancellable chat-completion relay for OpenAI-compatible APIs.
//!
//! `chat-relay` sits between a caller (typically an HTTP front end) and a
//! remote chat-completion API. It forwards a request upstream and returns
//! either the full completion or a live sequence of SSE-formatted chunk
//! events, while letting any other task cancel an in-flight request by id.
//! Every attempt, successful or not, produces exactly one usage line in an
//! append-only TSV ledger.
//!
//! # Getting started
//!
//! ```ignore
//! use chat_relay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let config = RelayConfig::from_env().map_err(|e| e.to_string())?;
//!     let relay = CompletionRelay::from_config(&config).map_err(|e| e.to_string())?;
//!
//!     let request = ChatRequest::new("gpt-4o-mini")
//!         .with_messages(&[Message::user("Say hello.")]);
//!
//!     let completion = relay
//!         .create_chat_completion(request, Some("req-1"))
//!         .await
//!         .map_err(|e| e.to_string())?;
//!     println!("{completion}");
//!     Ok(())
//! }
//! ```
//!
//! From another task, `relay.cancel_request("req-1")` aborts the call and the
//! caller receives [`RelayError::CancelledByCaller`] (status 499).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`relay`] | [`CompletionRelay`](relay::CompletionRelay) orchestration, cancellation registry, error classifier, usage ledger |
//! | [`api`] | [`Upstream`](api::Upstream) transport trait, reqwest-based [`OpenAiClient`](api::OpenAiClient), SSE decoding, retry |
//! | [`config`] | [`RelayConfig`](config::RelayConfig) with environment loading |
//! | [`error`] | [`UpstreamError`] and the caller-facing [`RelayError`] taxonomy |

pub mod api;
pub mod config;
pub mod error;
pub mod prelude;
pub mod relay;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use error::{RelayError, UpstreamError};

// ── Constants ──────────────────────────────────────────────────────

/// Default upstream base URL (OpenAI public API).
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default overall upstream call timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 90;

/// Default location of the usage ledger.
pub const DEFAULT_USAGE_STATS_PATH: &str = "./openai_usage.tsv";

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body.
///
/// The relay forwards caller parameters verbatim, so the body is kept as an
/// open JSON object rather than a closed struct. Helpers cover the handful of
/// fields the relay itself reads or rewrites.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct ChatRequest(pub Map<String, Value>);

impl ChatRequest {
    /// Create a request for the given model with no messages.
    pub fn new(model: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("model".into(), Value::String(model.into()));
        Self(body)
    }

    /// Wrap an arbitrary JSON value. Returns `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Set the `messages` array.
    pub fn with_messages(mut self, messages: &[Message]) -> Self {
        let messages = serde_json::to_value(messages).unwrap_or(Value::Array(Vec::new()));
        self.0.insert("messages".into(), messages);
        self
    }

    /// Set an arbitrary top-level parameter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The requested model, or `""` when absent.
    pub fn model(&self) -> &str {
        self.0.get("model").and_then(Value::as_str).unwrap_or("")
    }

    /// Whether the caller asked for a streamed response.
    pub fn is_stream(&self) -> bool {
        self.0.get("stream").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Force streaming mode and ask upstream to report usage on the stream.
    ///
    /// Existing `stream_options` keys are preserved; a non-object value is
    /// replaced.
    pub fn enable_streaming(&mut self) {
        self.0.insert("stream".into(), Value::Bool(true));
        let options = self
            .0
            .entry("stream_options")
            .or_insert_with(|| Value::Object(Map::new()));
        if !options.is_object() {
            *options = Value::Object(Map::new());
        }
        if let Value::Object(options) = options {
            options.insert("include_usage".into(), Value::Bool(true));
        }
    }
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A plain-text message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

// ── Endpoint identity ──────────────────────────────────────────────

/// Which flavour of the chat-completion API the upstream speaks.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    OpenAi,
    Azure,
}

impl ApiType {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiType::OpenAi => "openai",
            ApiType::Azure => "azure",
        }
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Response helpers ───────────────────────────────────────────────

/// Text of the first choice of a non-streaming completion, if any.
pub fn completion_text(completion: &Value) -> Option<&str> {
    completion
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
}

/// Text delta carried by the first choice of a streamed chunk, if any.
pub fn chunk_delta_text(chunk: &Value) -> Option<&str> {
    chunk
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
}
