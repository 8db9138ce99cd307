//! Upstream failure classification.
//!
//! Maps a raw [`UpstreamError`] to the caller-facing [`RelayError`]: the
//! status comes from the upstream category, the message from a
//! case-insensitive scan of the error text for well-known failure phrasings.

use crate::{RelayError, UpstreamError};

/// Recognized failure phrasing in upstream error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHint {
    RegionRestricted,
    InvalidCredentials,
    RateLimited,
    ModelNotFound,
    BillingIssue,
}

impl ErrorHint {
    /// Remediation message shown to the caller.
    pub fn message(self) -> &'static str {
        match self {
            ErrorHint::RegionRestricted => {
                "OpenAI API is not available in your region. Consider using a VPN or Azure OpenAI service."
            }
            ErrorHint::InvalidCredentials => {
                "Invalid API key. Please check your OPENAI_API_KEY configuration."
            }
            ErrorHint::RateLimited => {
                "Rate limit exceeded. Please wait and try again, or upgrade your API plan."
            }
            ErrorHint::ModelNotFound => {
                "Model not found. Please check your BIG_MODEL and SMALL_MODEL configuration."
            }
            ErrorHint::BillingIssue => {
                "Billing issue. Please check your OpenAI account billing status."
            }
        }
    }
}

/// Detect a known failure phrasing. First match wins.
pub fn detect_hint(detail: &str) -> Option<ErrorHint> {
    let lower = detail.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("unsupported_country_region_territory")
        || has("country, region, or territory not supported")
    {
        Some(ErrorHint::RegionRestricted)
    } else if has("invalid_api_key") || has("unauthorized") {
        Some(ErrorHint::InvalidCredentials)
    } else if has("rate_limit") || has("quota") {
        Some(ErrorHint::RateLimited)
    } else if has("model") && (has("not found") || has("does not exist")) {
        Some(ErrorHint::ModelNotFound)
    } else if has("billing") || has("payment") {
        Some(ErrorHint::BillingIssue)
    } else {
        None
    }
}

/// Caller-facing message for an upstream error text. Never fails: unknown
/// phrasing falls back to the raw text.
pub fn classify_message(detail: &str) -> String {
    match detect_hint(detail) {
        Some(hint) => hint.message().to_string(),
        None => detail.to_string(),
    }
}

/// Classify an upstream failure into the caller-facing taxonomy.
pub fn classify(error: &UpstreamError) -> RelayError {
    let raw = error.to_string();
    match error {
        UpstreamError::Authentication(_) => RelayError::InvalidCredentials {
            message: classify_message(&raw),
        },
        UpstreamError::RateLimit(_) => RelayError::RateLimited {
            message: classify_message(&raw),
        },
        UpstreamError::BadRequest(_) => RelayError::MalformedRequest {
            message: classify_message(&raw),
        },
        UpstreamError::Api { status, .. } => RelayError::GenericApiError {
            status: status.unwrap_or(500),
            message: classify_message(&raw),
        },
        UpstreamError::Other(_) => RelayError::UnexpectedError { raw },
    }
}

/// Usage-ledger error tag: `"<category>:<raw message>"`.
pub fn usage_error_tag(error: &UpstreamError) -> String {
    format!("{}:{}", error.tag(), error)
}
