//! Upstream interaction layer: transport trait, HTTP client, streaming, retry.
//!
//! These modules handle everything between the
//! [`CompletionRelay`](crate::relay::CompletionRelay) and the remote API:
//!
//! - [`upstream`]: the [`Upstream`] trait the relay drives, plus the
//!   [`Completion`], [`Chunk`], and [`ChunkStream`] aliases.
//! - [`openai`]: [`OpenAiClient`], the reqwest implementation for OpenAI and
//!   Azure OpenAI endpoints.
//! - [`streaming`]: incremental SSE decoder for `data:` chunk lines.
//! - [`retry`]: transient error detection (429, 5xx, network timeouts) with
//!   configurable exponential backoff and jitter. Never retries 400/401 errors.

pub mod openai;
pub mod retry;
pub mod streaming;
pub mod upstream;

pub use openai::OpenAiClient;
pub use retry::RetryConfig;
pub use upstream::{Chunk, ChunkStream, Completion, Upstream, UpstreamFuture};
