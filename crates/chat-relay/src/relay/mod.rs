//! Completion orchestration.
//!
//! [`CompletionRelay`] forwards a [`ChatRequest`] to an [`Upstream`] and ties
//! together the pieces around it:
//!
//! - [`registry`]: request id to cancellation signal, shared with whoever
//!   calls [`CompletionRelay::cancel_request`].
//! - [`classify`]: upstream failure to caller-facing [`RelayError`].
//! - [`usage`]: the append-only usage ledger.
//! - [`stream`]: the streaming path.
//!
//! Every call emits exactly one enter log line, one terminal log line and one
//! usage record, in that order, before its registration is released.

pub mod classify;
pub mod registry;
pub mod stream;
pub mod usage;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::api::{Completion, OpenAiClient, Upstream};
use crate::config::{ConfigError, RelayConfig};
use crate::{ApiType, ChatRequest, RelayError, UpstreamError};

pub use classify::{ErrorHint, classify};
pub use registry::{CancellationRegistry, CancellationSignal, Registration, generate_request_id};
pub use stream::{DONE_EVENT, EventStream};
pub use usage::{
    MemoryUsageSink, TokenUsage, TsvUsageRecorder, USAGE_COLUMNS, UsageRecord, UsageSink,
    UsageStatus,
};

use classify::usage_error_tag;
use usage::timestamp_now;

// ── Relay ──────────────────────────────────────────────────────────

/// Cancellable chat-completion relay.
///
/// Cheap to clone; clones share the upstream, the cancellation registry and
/// the usage sink.
#[derive(Clone)]
pub struct CompletionRelay {
    upstream: Arc<dyn Upstream>,
    registry: CancellationRegistry,
    usage: Arc<dyn UsageSink>,
}

impl CompletionRelay {
    pub fn new(upstream: Arc<dyn Upstream>, usage: Arc<dyn UsageSink>) -> Self {
        Self {
            upstream,
            registry: CancellationRegistry::new(),
            usage,
        }
    }

    /// Build the production relay: [`OpenAiClient`] upstream and a TSV ledger
    /// at the configured path.
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let upstream = OpenAiClient::new(config)?;
        let usage = TsvUsageRecorder::new(config.usage_stats_path.clone());
        info!(
            "Relay configured: base_url={}, api_type={}, timeout={}s, usage_file={}",
            config.base_url,
            config.api_type(),
            config.timeout.as_secs(),
            config.usage_stats_path.display()
        );
        Ok(Self::new(Arc::new(upstream), Arc::new(usage)))
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    /// Forward a non-streaming request and return the full completion.
    ///
    /// With a `request_id`, the upstream call races the id's cancellation
    /// signal; if the signal wins the call is abandoned and the result is
    /// [`RelayError::CancelledByCaller`].
    pub async fn create_chat_completion(
        &self,
        request: ChatRequest,
        request_id: Option<&str>,
    ) -> Result<Completion, RelayError> {
        // Declared first so it is released after the attempt is recorded.
        let registration = request_id.map(|id| self.registry.register_scoped(id));
        let attempt = Attempt::begin(
            Arc::clone(&self.usage),
            self.upstream.as_ref(),
            &request,
            request_id,
            false,
        );

        let upstream = Arc::clone(&self.upstream);
        let call = AbortOnDrop(tokio::spawn(async move { upstream.send(request).await }));

        let outcome = match registration.as_ref() {
            Some(reg) => race(call, reg.signal().clone()).await,
            None => RaceOutcome::from_join(call.await),
        };

        match outcome {
            RaceOutcome::Cancelled => Err(attempt.cancel()),
            RaceOutcome::Completed(Ok(completion)) => {
                attempt.succeed(TokenUsage::from_completion(&completion));
                Ok(completion)
            }
            RaceOutcome::Completed(Err(err)) => Err(attempt.fail(&err)),
        }
    }

    /// Forward a streaming request.
    ///
    /// The request id (if any) is registered immediately. Upstream is
    /// contacted on the first poll. Items are `data: <chunk json>` events,
    /// terminated by [`DONE_EVENT`] on success or by a single `Err` on
    /// failure or cancellation.
    pub fn create_chat_completion_stream(
        &self,
        request: ChatRequest,
        request_id: Option<&str>,
    ) -> EventStream {
        stream::event_stream(self, request, request_id)
    }

    /// Signal cancellation of an in-flight request. Returns whether the id
    /// was registered.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let found = self.registry.cancel(request_id);
        if found {
            info!("Cancellation requested: request_id={request_id}");
        } else {
            info!("Cancellation requested for unknown request: request_id={request_id}");
        }
        found
    }
}

impl std::fmt::Debug for CompletionRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionRelay")
            .field("base_url", &self.upstream.base_url())
            .field("api_type", &self.upstream.api_type())
            .field("in_flight", &self.registry.len())
            .finish()
    }
}

// ── Race ───────────────────────────────────────────────────────────

/// Spawned task handle that aborts the task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum RaceOutcome {
    Completed(Result<Completion, UpstreamError>),
    Cancelled,
}

impl RaceOutcome {
    fn from_join(joined: Result<Result<Completion, UpstreamError>, JoinError>) -> Self {
        match joined {
            Ok(result) => RaceOutcome::Completed(result),
            Err(e) => RaceOutcome::Completed(Err(UpstreamError::Other(format!(
                "upstream task failed: {e}"
            )))),
        }
    }
}

/// First of upstream completion and cancellation wins. A signal that is
/// already set wins over a call that has also finished.
async fn race(
    mut call: AbortOnDrop<Result<Completion, UpstreamError>>,
    signal: CancellationSignal,
) -> RaceOutcome {
    tokio::select! {
        biased;
        () = signal.wait() => RaceOutcome::Cancelled,
        joined = &mut call => RaceOutcome::from_join(joined),
    }
}

// ── Attempt bookkeeping ────────────────────────────────────────────

/// Logging and usage accounting for one relay call.
///
/// Consumed by exactly one of [`succeed`](Self::succeed),
/// [`fail`](Self::fail) or [`cancel`](Self::cancel). Dropped without any of
/// them (the caller abandoned the call), it records an `aborted` outcome.
pub(crate) struct Attempt {
    sink: Arc<dyn UsageSink>,
    request_id: Option<String>,
    model: String,
    base_url: String,
    api_type: ApiType,
    is_stream: bool,
    started: Instant,
    started_at: String,
    armed: bool,
}

impl Attempt {
    pub(crate) fn begin(
        sink: Arc<dyn UsageSink>,
        upstream: &dyn Upstream,
        request: &ChatRequest,
        request_id: Option<&str>,
        is_stream: bool,
    ) -> Self {
        let attempt = Self {
            sink,
            request_id: request_id.map(str::to_string),
            model: request.model().to_string(),
            base_url: upstream.base_url().to_string(),
            api_type: upstream.api_type(),
            is_stream,
            started: Instant::now(),
            started_at: timestamp_now(),
            armed: true,
        };
        info!(
            "[ENTER] {}: request_id={}, model={}, base_url={}",
            attempt.operation(),
            attempt.id_for_log(),
            attempt.model,
            attempt.base_url
        );
        attempt
    }

    fn operation(&self) -> &'static str {
        if self.is_stream {
            "create_chat_completion_stream"
        } else {
            "create_chat_completion"
        }
    }

    fn id_for_log(&self) -> &str {
        self.request_id.as_deref().unwrap_or("-")
    }

    fn latency_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn record(&self, timestamp: String, usage: TokenUsage, status: UsageStatus, error: String) {
        self.sink.append(&UsageRecord {
            timestamp,
            request_id: self.request_id.clone().unwrap_or_default(),
            is_stream: self.is_stream,
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            api_type: self.api_type,
            usage,
            latency_ms: self.latency_ms(),
            status,
            error,
        });
    }

    pub(crate) fn succeed(mut self, usage: TokenUsage) {
        self.armed = false;
        info!(
            "[SUCCESS] {}: request_id={}, model={}, in={}, out={}, cache_in={}, latency_ms={}",
            self.operation(),
            self.id_for_log(),
            self.model,
            usage.input_tokens,
            usage.output_tokens,
            usage.cached_input_tokens,
            self.latency_ms()
        );
        let started_at = std::mem::take(&mut self.started_at);
        self.record(started_at, usage, UsageStatus::Success, String::new());
    }

    /// Log and record an upstream failure, returning the classified error.
    pub(crate) fn fail(mut self, err: &UpstreamError) -> RelayError {
        self.armed = false;
        match err {
            UpstreamError::Api { .. } => error!(
                "[FAIL] {} {}: request_id={}, status={}, err={}",
                self.operation(),
                failure_label(err),
                self.id_for_log(),
                err.status_code(),
                err
            ),
            _ => error!(
                "[FAIL] {} {}: request_id={}, err={}",
                self.operation(),
                failure_label(err),
                self.id_for_log(),
                err
            ),
        }
        self.record(
            timestamp_now(),
            TokenUsage::default(),
            UsageStatus::Error,
            usage_error_tag(err),
        );
        classify(err)
    }

    /// Log and record a caller cancellation.
    pub(crate) fn cancel(mut self) -> RelayError {
        self.armed = false;
        let err = RelayError::CancelledByCaller;
        info!(
            "[CANCEL] {}: request_id={}, latency_ms={}",
            self.operation(),
            self.id_for_log(),
            self.latency_ms()
        );
        self.record(
            timestamp_now(),
            TokenUsage::default(),
            UsageStatus::Error,
            format!("cancelled:{err}"),
        );
        err
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            "[ABORT] {}: request_id={}, latency_ms={}, caller went away before completion",
            self.operation(),
            self.id_for_log(),
            self.latency_ms()
        );
        self.record(
            timestamp_now(),
            TokenUsage::default(),
            UsageStatus::Error,
            "aborted:request abandoned by caller".to_string(),
        );
    }
}

fn failure_label(err: &UpstreamError) -> &'static str {
    match err {
        UpstreamError::Authentication(_) => "auth error",
        UpstreamError::RateLimit(_) => "rate limit",
        UpstreamError::BadRequest(_) => "bad request",
        UpstreamError::Api { .. } => "api error",
        UpstreamError::Other(_) => "unexpected",
    }
}
