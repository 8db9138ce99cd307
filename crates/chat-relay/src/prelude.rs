//! Convenience re-exports for common `chat-relay` types.
//!
//! ```ignore
//! use chat_relay::prelude::*;
//! ```
//!
//! Covers building a relay, issuing and cancelling requests, and handling
//! their errors. SSE decoding and retry internals live in [`crate::api`].

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ApiType, ChatRequest, Message, MessageRole, RelayError, UpstreamError};
pub use crate::{chunk_delta_text, completion_text};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::api::RetryConfig;
pub use crate::config::{ConfigError, RelayConfig};

// ── Transport ───────────────────────────────────────────────────────
pub use crate::api::{Chunk, ChunkStream, Completion, OpenAiClient, Upstream, UpstreamFuture};

// ── Relay ───────────────────────────────────────────────────────────
pub use crate::relay::{
    CancellationRegistry, CompletionRelay, DONE_EVENT, EventStream, MemoryUsageSink,
    TsvUsageRecorder, UsageRecord, UsageSink, generate_request_id,
};
