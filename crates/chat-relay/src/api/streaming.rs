//! Server-Sent Events (SSE) decoding for chat-completion streams.
//!
//! [`SseDecoder`] turns raw body bytes into parsed chunk objects, one per
//! `data:` line. [`chunk_stream`] wraps a live `reqwest::Response` in a
//! [`ChunkStream`] that reads the body incrementally via `chunk()`, so long
//! responses never hit a single-body timeout.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, trace};

use super::upstream::{Chunk, ChunkStream};
use crate::UpstreamError;

/// Result of decoding one SSE line.
#[derive(Debug, PartialEq)]
pub enum SseLine {
    /// Blank line, comment, or a field the relay does not use.
    Skip,
    /// The `data: [DONE]` terminator.
    Done,
    /// A decoded `data:` payload (or the failure it carried).
    Data(Result<Chunk, UpstreamError>),
}

/// Decode a single SSE line.
///
/// A payload carrying an `error` object instead of chunk data surfaces as an
/// upstream API failure.
pub fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => match value.get("error").filter(|e| !e.is_null()) {
            Some(error) => {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                SseLine::Data(Err(UpstreamError::Api {
                    status: None,
                    message: format!("stream error: {message}"),
                }))
            }
            None => SseLine::Data(Ok(value)),
        },
        Err(e) => SseLine::Data(Err(UpstreamError::Other(format!(
            "failed to parse SSE chunk: {e}"
        )))),
    }
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across network reads decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` terminator has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes and return every chunk completed by them.
    ///
    /// Input after `[DONE]` is ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Chunk, UpstreamError>> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut out = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if self.decode_line(&line, &mut out) {
                self.buffer.clear();
                break;
            }
        }
        out
    }

    /// Flush an unterminated final line at end of body.
    pub fn finish(&mut self) -> Vec<Result<Chunk, UpstreamError>> {
        let mut out = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut out);
        }
        self.done = true;
        out
    }

    /// Returns `true` when the line was the terminator.
    fn decode_line(&mut self, line: &[u8], out: &mut Vec<Result<Chunk, UpstreamError>>) -> bool {
        let text = String::from_utf8_lossy(line);
        match parse_sse_line(&text) {
            SseLine::Skip => false,
            SseLine::Done => {
                trace!("SSE stream terminator received");
                self.done = true;
                true
            }
            SseLine::Data(item) => {
                out.push(item);
                false
            }
        }
    }
}

/// Reader state behind [`chunk_stream`].
struct SseReader {
    resp: reqwest::Response,
    decoder: SseDecoder,
    pending: VecDeque<Result<Chunk, UpstreamError>>,
    exhausted: bool,
    chunks_read: usize,
}

impl SseReader {
    async fn next_chunk(&mut self) -> Option<Result<Chunk, UpstreamError>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                self.chunks_read += 1;
                return Some(item);
            }
            if self.exhausted {
                debug!("SSE stream completed after {} chunk(s)", self.chunks_read);
                return None;
            }
            match self.resp.chunk().await {
                Ok(Some(bytes)) => {
                    self.pending.extend(self.decoder.feed(&bytes));
                    if self.decoder.is_done() {
                        self.exhausted = true;
                    }
                }
                Ok(None) => {
                    self.pending.extend(self.decoder.finish());
                    self.exhausted = true;
                }
                Err(e) => {
                    self.exhausted = true;
                    self.pending.clear();
                    return Some(Err(UpstreamError::Api {
                        status: None,
                        message: format!("failed to read streaming chunk: {e}"),
                    }));
                }
            }
        }
    }
}

/// Adapt a successful streaming response into a [`ChunkStream`].
pub fn chunk_stream(resp: reqwest::Response) -> ChunkStream {
    let reader = SseReader {
        resp,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        exhausted: false,
        chunks_read: 0,
    };
    Box::pin(futures::stream::unfold(reader, |mut reader| async move {
        let item = reader.next_chunk().await?;
        Some((item, reader))
    }))
}
