//! Usage ledger: one tab-separated line per terminal request outcome.
//!
//! The ledger is best-effort telemetry. [`TsvUsageRecorder`] never returns an
//! error to its caller; write failures are logged and dropped.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error};

use crate::ApiType;

/// Ledger columns, in file order.
pub const USAGE_COLUMNS: [&str; 13] = [
    "timestamp",
    "request_id",
    "is_stream",
    "model",
    "base_url",
    "api_type",
    "input_tokens",
    "output_tokens",
    "cache_read_input_tokens",
    "total_tokens",
    "latency_ms",
    "status",
    "error",
];

/// Token counts extracted from an upstream usage block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
}

impl TokenUsage {
    /// Extract counts from a `usage` object. Each field is read on its own;
    /// missing, null or non-integer values count as 0.
    pub fn from_usage_block(usage: &Value) -> Self {
        let count = |pointer: &str| usage.pointer(pointer).and_then(Value::as_u64).unwrap_or(0);
        Self {
            input_tokens: count("/prompt_tokens"),
            output_tokens: count("/completion_tokens"),
            cached_input_tokens: count("/prompt_tokens_details/cached_tokens"),
        }
    }

    /// Extract counts from a full completion body's `usage` field.
    pub fn from_completion(completion: &Value) -> Self {
        completion
            .get("usage")
            .map(Self::from_usage_block)
            .unwrap_or_default()
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Outcome column of a ledger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStatus {
    Success,
    Error,
}

impl UsageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageStatus::Success => "success",
            UsageStatus::Error => "error",
        }
    }
}

/// One immutable ledger line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub timestamp: String,
    /// Empty when the caller supplied no request id.
    pub request_id: String,
    pub is_stream: bool,
    pub model: String,
    pub base_url: String,
    pub api_type: ApiType,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub status: UsageStatus,
    /// `"<category>:<raw message>"` on failure, empty on success.
    pub error: String,
}

impl UsageRecord {
    /// Field values in [`USAGE_COLUMNS`] order, unsanitized.
    pub fn fields(&self) -> [String; 13] {
        [
            self.timestamp.clone(),
            self.request_id.clone(),
            if self.is_stream { "True" } else { "False" }.to_string(),
            self.model.clone(),
            self.base_url.clone(),
            self.api_type.to_string(),
            self.usage.input_tokens.to_string(),
            self.usage.output_tokens.to_string(),
            self.usage.cached_input_tokens.to_string(),
            self.usage.total().to_string(),
            self.latency_ms.to_string(),
            self.status.as_str().to_string(),
            self.error.clone(),
        ]
    }

    /// Render as one ledger line, including the trailing newline.
    pub fn to_tsv_line(&self) -> String {
        let fields: Vec<String> = self.fields().iter().map(|f| sanitize_field(f)).collect();
        format!("{}\n", fields.join("\t"))
    }
}

/// Replace tabs and newlines so a value cannot break the line structure.
pub fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n'], " ")
}

/// Ledger timestamp: naive UTC, microsecond precision.
pub fn timestamp_now() -> String {
    Utc::now()
        .naive_utc()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Destination for usage records.
///
/// Implementations must serialize concurrent appends and must not fail the
/// caller.
pub trait UsageSink: Send + Sync {
    fn append(&self, record: &UsageRecord);
}

/// Append-only TSV file ledger.
///
/// The header row is written when the file is first created. Appends from
/// all tasks are serialized through one lock per recorder; share a single
/// recorder per file.
#[derive(Debug)]
pub struct TsvUsageRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TsvUsageRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let is_new = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut buf = String::new();
        if is_new {
            buf.push_str(&USAGE_COLUMNS.join("\t"));
            buf.push('\n');
        }
        buf.push_str(line);
        file.write_all(buf.as_bytes())
    }
}

impl UsageSink for TsvUsageRecorder {
    fn append(&self, record: &UsageRecord) {
        debug!(
            "Recording usage: model={}, stream={}, in={}, out={}",
            record.model, record.is_stream, record.usage.input_tokens, record.usage.output_tokens
        );
        match self.try_append(&record.to_tsv_line()) {
            Ok(()) => debug!(
                "Usage recorded: file={}, model={}, request_id={}",
                self.path.display(),
                record.model,
                record.request_id
            ),
            Err(e) => error!(
                "Failed to record usage to {}: {e}",
                self.path.display()
            ),
        }
    }
}

/// In-memory sink, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record appended so far, in order.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl UsageSink for MemoryUsageSink {
    fn append(&self, record: &UsageRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}
