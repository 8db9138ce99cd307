//! Streaming path: upstream chunks re-emitted as SSE `data:` events.
//!
//! The event stream is single-pass. Cancellation is observed between chunks
//! only: a pending upstream read is never preempted, but no chunk is handed
//! out once the signal is set.

use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;

use super::registry::Registration;
use super::usage::TokenUsage;
use super::{Attempt, CompletionRelay};
use crate::api::{ChunkStream, Upstream};
use crate::{ChatRequest, RelayError, UpstreamError};

/// Serialized chunk events, ending in [`DONE_EVENT`] or a single error.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

/// Terminal event of a successful stream.
pub const DONE_EVENT: &str = "data: [DONE]";

enum Phase {
    /// Upstream not contacted yet.
    Pending(ChatRequest),
    Streaming(ChunkStream),
    Finished,
}

// Field order matters on drop: an abandoned attempt is recorded before its
// registration is released.
struct StreamState {
    upstream: Arc<dyn Upstream>,
    phase: Phase,
    last_usage: Option<Value>,
    attempt: Option<Attempt>,
    registration: Option<Registration>,
}

pub(crate) fn event_stream(
    relay: &CompletionRelay,
    mut request: ChatRequest,
    request_id: Option<&str>,
) -> EventStream {
    request.enable_streaming();
    let registration = request_id.map(|id| relay.registry.register_scoped(id));
    let attempt = Attempt::begin(
        Arc::clone(&relay.usage),
        relay.upstream.as_ref(),
        &request,
        request_id,
        true,
    );

    let state = StreamState {
        upstream: Arc::clone(&relay.upstream),
        phase: Phase::Pending(request),
        last_usage: None,
        attempt: Some(attempt),
        registration,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        let event = state.next_event().await?;
        Some((event, state))
    }))
}

impl StreamState {
    async fn next_event(&mut self) -> Option<Result<String, RelayError>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Finished => return None,
                Phase::Pending(request) => {
                    let opened = self.upstream.send_streaming(request).await;
                    match opened {
                        Ok(chunks) => self.phase = Phase::Streaming(chunks),
                        Err(err) => return Some(Err(self.fail(&err))),
                    }
                }
                Phase::Streaming(mut chunks) => {
                    let next = chunks.next().await;
                    return match next {
                        Some(Ok(chunk)) => {
                            if self.is_cancelled() {
                                return Some(Err(self.cancel()));
                            }
                            if let Some(usage) = chunk
                                .get("usage")
                                .filter(|u| u.as_object().is_some_and(|m| !m.is_empty()))
                            {
                                self.last_usage = Some(usage.clone());
                            }
                            self.phase = Phase::Streaming(chunks);
                            Some(Ok(format!("data: {chunk}")))
                        }
                        Some(Err(err)) => Some(Err(self.fail(&err))),
                        None => {
                            self.succeed();
                            Some(Ok(DONE_EVENT.to_string()))
                        }
                    };
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|r| r.signal().is_set())
    }

    fn succeed(&mut self) {
        let usage = self
            .last_usage
            .as_ref()
            .map(TokenUsage::from_usage_block)
            .unwrap_or_default();
        if let Some(attempt) = self.attempt.take() {
            attempt.succeed(usage);
        }
        self.registration = None;
    }

    fn fail(&mut self, err: &UpstreamError) -> RelayError {
        let classified = match self.attempt.take() {
            Some(attempt) => attempt.fail(err),
            None => super::classify(err),
        };
        self.registration = None;
        classified
    }

    fn cancel(&mut self) -> RelayError {
        let err = match self.attempt.take() {
            Some(attempt) => attempt.cancel(),
            None => RelayError::CancelledByCaller,
        };
        self.registration = None;
        err
    }
}
