//! Error types for the relay.
//!
//! [`UpstreamError`] is what a transport reports. [`RelayError`] is what the
//! caller sees after classification: each variant carries its HTTP-equivalent
//! status and a remediation message.

use thiserror::Error;

/// A failure reported by the upstream transport.
///
/// The payload is the raw upstream text (typically `"HTTP <status>: <body>"`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Upstream rejected the credentials (HTTP 401).
    #[error("{0}")]
    Authentication(String),
    /// Upstream rate limit or quota exceeded (HTTP 429).
    #[error("{0}")]
    RateLimit(String),
    /// Upstream rejected the request as malformed (HTTP 400).
    #[error("{0}")]
    BadRequest(String),
    /// Any other upstream API failure. `status` is `None` for transport-level
    /// failures (connect errors, timeouts, broken streams).
    #[error("{message}")]
    Api {
        status: Option<u16>,
        message: String,
    },
    /// A failure that does not come from the upstream API itself.
    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    /// Short tag used as the prefix of the usage ledger's `error` column.
    pub fn tag(&self) -> &'static str {
        match self {
            UpstreamError::Authentication(_) => "auth",
            UpstreamError::RateLimit(_) => "ratelimit",
            UpstreamError::BadRequest(_) => "badrequest",
            UpstreamError::Api { .. } => "api",
            UpstreamError::Other(_) => "unexpected",
        }
    }

    /// Status code the caller will see for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            UpstreamError::Authentication(_) => 401,
            UpstreamError::RateLimit(_) => 429,
            UpstreamError::BadRequest(_) => 400,
            UpstreamError::Api { status, .. } => status.unwrap_or(500),
            UpstreamError::Other(_) => 500,
        }
    }
}

/// Canonical status for a request cancelled by its caller.
pub const STATUS_CANCELLED: u16 = 499;

/// Caller-facing error taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The request was cancelled through [`cancel_request`](crate::relay::CompletionRelay::cancel_request).
    #[error("Request cancelled by client")]
    CancelledByCaller,
    #[error("{message}")]
    InvalidCredentials { message: String },
    #[error("{message}")]
    RateLimited { message: String },
    #[error("{message}")]
    MalformedRequest { message: String },
    #[error("{message}")]
    GenericApiError { status: u16, message: String },
    #[error("Unexpected error: {raw}")]
    UnexpectedError { raw: String },
}

impl RelayError {
    /// HTTP-equivalent status code.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::CancelledByCaller => STATUS_CANCELLED,
            RelayError::InvalidCredentials { .. } => 401,
            RelayError::RateLimited { .. } => 429,
            RelayError::MalformedRequest { .. } => 400,
            RelayError::GenericApiError { status, .. } => *status,
            RelayError::UnexpectedError { .. } => 500,
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::CancelledByCaller => "cancelled_by_caller",
            RelayError::InvalidCredentials { .. } => "invalid_credentials",
            RelayError::RateLimited { .. } => "rate_limited",
            RelayError::MalformedRequest { .. } => "malformed_request",
            RelayError::GenericApiError { .. } => "api_error",
            RelayError::UnexpectedError { .. } => "unexpected_error",
        }
    }

    /// Human-readable message for the caller.
    pub fn message(&self) -> String {
        self.to_string()
    }
}
