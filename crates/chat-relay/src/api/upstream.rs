//! The upstream transport seam.
//!
//! The relay never talks HTTP directly; it drives an [`Upstream`]
//! implementation. [`OpenAiClient`](super::OpenAiClient) is the production
//! one. Tests plug in scripted doubles.

use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use serde_json::Value;

use crate::{ApiType, ChatRequest, UpstreamError};

/// Full non-streaming response body, as returned by upstream.
pub type Completion = Value;

/// One increment of a streamed response, as returned by upstream.
pub type Chunk = Value;

/// Sequence of streamed chunks. Ends when upstream signals completion.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, UpstreamError>> + Send>>;

/// Boxed future returned by [`Upstream`] methods.
pub type UpstreamFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UpstreamError>> + Send + 'a>>;

/// A chat-completion API the relay can forward to.
///
/// Implementations own their HTTP client, credentials, and timeout; the relay
/// only sees requests, completions, chunks, and typed failures.
pub trait Upstream: Send + Sync {
    /// Send a non-streaming request and return the full completion.
    fn send(&self, request: ChatRequest) -> UpstreamFuture<'_, Completion>;

    /// Send a streaming request. Resolves once the stream is open; chunk
    /// reads may fail individually.
    fn send_streaming(&self, request: ChatRequest) -> UpstreamFuture<'_, ChunkStream>;

    /// Endpoint identity recorded in the usage ledger.
    fn base_url(&self) -> &str;

    /// API flavour recorded in the usage ledger.
    fn api_type(&self) -> ApiType;
}
