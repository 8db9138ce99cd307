//! Relay configuration with sensible defaults.
//!
//! [`RelayConfig`] captures everything needed to build a
//! [`CompletionRelay`](crate::relay::CompletionRelay): upstream endpoint,
//! credentials, timeout, retry policy, and the usage ledger location. Build it
//! with [`RelayConfig::new`] plus `with_*` setters, or load it from the
//! environment with [`RelayConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::api::retry::RetryConfig;
use crate::{ApiType, DEFAULT_BASE_URL, DEFAULT_TIMEOUT_SECS, DEFAULT_USAGE_STATS_PATH};

/// Environment variable holding the upstream API key.
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
/// Environment variable overriding the upstream base URL.
pub const ENV_BASE_URL: &str = "OPENAI_BASE_URL";
/// Environment variable selecting the Azure variant (its API version).
pub const ENV_API_VERSION: &str = "AZURE_API_VERSION";
/// Environment variable with the upstream timeout in seconds.
pub const ENV_TIMEOUT: &str = "REQUEST_TIMEOUT";
/// Environment variable with the usage ledger path.
pub const ENV_USAGE_STATS_PATH: &str = "USAGE_STATS_PATH";
/// Environment variable with the transport retry count.
pub const ENV_MAX_RETRIES: &str = "MAX_RETRIES";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Settings for one relay instance (one upstream client).
#[derive(Clone)]
pub struct RelayConfig {
    /// Upstream API key.
    pub api_key: String,
    /// Upstream base URL. For Azure this is the resource endpoint.
    /// Default: `https://api.openai.com/v1`.
    pub base_url: String,
    /// Overall upstream call timeout, fixed at client construction.
    /// Default: 90 seconds.
    pub timeout: Duration,
    /// Azure API version. `Some` selects the Azure variant.
    pub api_version: Option<String>,
    /// Usage ledger location. Default: `./openai_usage.tsv`.
    pub usage_stats_path: PathBuf,
    /// Transport retry policy.
    pub retry: RetryConfig,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("api_version", &self.api_version)
            .field("usage_stats_path", &self.usage_stats_path)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            api_version: None,
            usage_stats_path: PathBuf::from(DEFAULT_USAGE_STATS_PATH),
            retry: RetryConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Create a config with the given API key and defaults for everything else.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Select the Azure variant with the given API version.
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = Some(api_version.into());
        self
    }

    pub fn with_usage_stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.usage_stats_path = path.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Which API flavour this config talks to.
    pub fn api_type(&self) -> ApiType {
        if self.api_version.is_some() {
            ApiType::Azure
        } else {
            ApiType::OpenAi
        }
    }

    /// Load from process environment variables.
    ///
    /// `OPENAI_API_KEY` is required. `OPENAI_BASE_URL`, `AZURE_API_VERSION`,
    /// `REQUEST_TIMEOUT` (seconds), `USAGE_STATS_PATH`, and `MAX_RETRIES`
    /// override the defaults when set and non-empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get(ENV_API_KEY).ok_or(ConfigError::MissingVar(ENV_API_KEY))?;
        let mut config = Self::new(api_key);

        if let Some(base_url) = get(ENV_BASE_URL) {
            config.base_url = base_url;
        }
        config.api_version = get(ENV_API_VERSION);
        if let Some(raw) = get(ENV_TIMEOUT) {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: ENV_TIMEOUT,
                    value: raw.clone(),
                })?;
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(path) = get(ENV_USAGE_STATS_PATH) {
            config.usage_stats_path = PathBuf::from(path);
        }
        if let Some(raw) = get(ENV_MAX_RETRIES) {
            let retries = raw
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: ENV_MAX_RETRIES,
                    value: raw.clone(),
                })?;
            config.retry = RetryConfig::with_retries(retries);
        }

        Ok(config)
    }
}
