//! Configuration loading, validation, and pre-computed runtime state.
//!
//! The gateway reads its YAML configuration exactly once at startup and
//! turns it into a [`RuntimeConfig`] holding parsed addresses, durations,
//! and the quota policy. The completion service credential never appears
//! in the file; it is read from the environment variable the file names.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use hyper::header::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::quota::QuotaPolicy;
use crate::{GateError, Result};

/// Default socket address the gateway binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8100";

/// Default path of the doubt-solving endpoint.
pub const DEFAULT_PATH: &str = "/api/solve-doubt";

/// Default maximum request body size: 64 KiB.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 64 * 1024;

/// Default maximum number of concurrent in-flight requests before the
/// gateway answers 503.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

/// Default value of `Access-Control-Allow-Origin`.
pub const DEFAULT_ALLOWED_ORIGIN: &str = "*";

/// Default requests per window for anonymous callers.
pub const DEFAULT_ANONYMOUS_LIMIT: u32 = 10;

/// Default requests per window for authenticated callers.
pub const DEFAULT_AUTHENTICATED_LIMIT: u32 = 35;

/// Default quota window.
pub const DEFAULT_QUOTA_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Default base URL of the OpenAI-compatible completion API.
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com/v1";

/// Default completion model.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default completion length cap in tokens.
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Default bound on a single completion call.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default environment variable holding the completion service credential.
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Raw configuration as deserialized from the YAML file.
///
/// This struct maps directly to the on-disk schema. After loading, it is
/// transformed into a [`RuntimeConfig`] with every value parsed and checked.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address the gateway listens on (default `"127.0.0.1:8100"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Path of the doubt-solving endpoint (default `"/api/solve-doubt"`).
    #[serde(default)]
    pub path: Option<String>,
    /// Maximum allowed request body size in bytes (default: 64 KiB).
    #[serde(default)]
    pub max_body_size: Option<u64>,
    /// Maximum concurrent in-flight requests before returning 503
    /// (default: 256).
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
    /// Value sent in `Access-Control-Allow-Origin` (default: `"*"`).
    #[serde(default)]
    pub allowed_origin: Option<String>,
    /// Per-tier quota limits and window.
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Completion service settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaConfig {
    /// Requests per window for anonymous callers (default: 10).
    #[serde(default = "default_anonymous_limit")]
    pub anonymous_limit: u32,
    /// Requests per window for authenticated callers (default: 35).
    #[serde(default = "default_authenticated_limit")]
    pub authenticated_limit: u32,
    /// Window length in seconds (default: 86400).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Interval in seconds between sweeps that drop expired ledger records.
    /// When absent, records are only reset lazily.
    #[serde(default)]
    pub prune_interval_secs: Option<u64>,
}

fn default_anonymous_limit() -> u32 {
    DEFAULT_ANONYMOUS_LIMIT
}

fn default_authenticated_limit() -> u32 {
    DEFAULT_AUTHENTICATED_LIMIT
}

fn default_window_secs() -> u64 {
    DEFAULT_QUOTA_WINDOW.as_secs()
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            anonymous_limit: default_anonymous_limit(),
            authenticated_limit: default_authenticated_limit(),
            window_secs: default_window_secs(),
            prune_interval_secs: None,
        }
    }
}

/// Completion service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL of the OpenAI-compatible API; `/chat/completions` is appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model identifier sent with every completion.
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature, between 0 and 2 (default: 0.7).
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion length cap in tokens (default: 1000).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Timeout in milliseconds for a single completion call (default: 30000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Name of the environment variable holding the API key
    /// (default: `OPENAI_API_KEY`).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_base_url() -> String {
    DEFAULT_UPSTREAM_BASE_URL.into()
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT.as_millis() as u64
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.into()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_ms: default_timeout_ms(),
            api_key_env: default_api_key_env(),
        }
    }
}

/// Validated completion service settings.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSettings {
    /// Full URI of the chat completions endpoint.
    pub endpoint: hyper::Uri,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion length cap in tokens.
    pub max_tokens: u32,
    /// Bound on a single completion call.
    pub timeout: Duration,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all request handlers via `Arc`.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Socket address the gateway binds to.
    pub listen: SocketAddr,
    /// Path of the doubt-solving endpoint.
    pub path: String,
    /// Maximum request body size in bytes. Larger bodies receive 413.
    pub max_body_size: u64,
    /// Maximum concurrent in-flight requests. Overflow yields 503.
    pub max_concurrent_requests: usize,
    /// Pre-validated `Access-Control-Allow-Origin` value.
    pub allowed_origin: HeaderValue,
    /// Per-tier limits and window enforced by the quota ledger.
    pub quota: QuotaPolicy,
    /// Interval between ledger sweeps. `None` disables the sweeper.
    pub prune_interval: Option<Duration>,
    /// Completion service settings.
    pub upstream: UpstreamSettings,
}

/// Builds the chat completions URI from a base URL.
fn completions_endpoint(base_url: &str) -> Result<hyper::Uri> {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(GateError::Config("upstream base_url must not be empty".into()));
    }

    let uri = format!("{trimmed}/chat/completions")
        .parse::<hyper::Uri>()
        .map_err(|e| GateError::Config(format!("invalid upstream base_url \"{base_url}\": {e}")))?;

    match (uri.scheme_str(), uri.authority()) {
        (Some("http" | "https"), Some(_)) => Ok(uri),
        _ => Err(GateError::Config(format!(
            "upstream base_url must be an absolute http(s) URL: {base_url}"
        ))),
    }
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`GateError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            GateError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| GateError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`].
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            GateError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let path = self.path.unwrap_or_else(|| DEFAULT_PATH.into());
        if !path.starts_with('/') {
            return Err(GateError::Config(format!(
                "endpoint path must start with '/': {path}"
            )));
        }

        let allowed_origin_str = self.allowed_origin.as_deref().unwrap_or(DEFAULT_ALLOWED_ORIGIN);
        let allowed_origin = HeaderValue::from_str(allowed_origin_str).map_err(|e| {
            GateError::Config(format!("invalid allowed_origin \"{allowed_origin_str}\": {e}"))
        })?;

        if self.quota.anonymous_limit == 0 || self.quota.authenticated_limit == 0 {
            return Err(GateError::Config("quota limits must be positive".into()));
        }
        if self.quota.window_secs == 0 {
            return Err(GateError::Config("quota window_secs must be positive".into()));
        }
        let quota = QuotaPolicy {
            anonymous_limit: self.quota.anonymous_limit,
            authenticated_limit: self.quota.authenticated_limit,
            window: Duration::from_secs(self.quota.window_secs),
        };

        let prune_interval = match self.quota.prune_interval_secs {
            Some(0) => {
                return Err(GateError::Config(
                    "quota prune_interval_secs must be positive".into(),
                ));
            }
            other => other.map(Duration::from_secs),
        };

        let max_concurrent_requests = self
            .max_concurrent_requests
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);
        if max_concurrent_requests == 0 {
            return Err(GateError::Config(
                "max_concurrent_requests must be positive".into(),
            ));
        }

        let upstream = self.upstream;
        if !(0.0..=2.0).contains(&upstream.temperature) {
            return Err(GateError::Config(format!(
                "upstream temperature must be between 0 and 2: {}",
                upstream.temperature
            )));
        }
        if upstream.model.trim().is_empty() {
            return Err(GateError::Config("upstream model must not be empty".into()));
        }
        if upstream.timeout_ms == 0 {
            return Err(GateError::Config("upstream timeout_ms must be positive".into()));
        }

        let upstream = UpstreamSettings {
            endpoint: completions_endpoint(&upstream.base_url)?,
            model: upstream.model,
            temperature: upstream.temperature,
            max_tokens: upstream.max_tokens,
            timeout: Duration::from_millis(upstream.timeout_ms),
            api_key_env: upstream.api_key_env,
        };

        Ok(RuntimeConfig {
            listen,
            path,
            max_body_size: self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
            max_concurrent_requests,
            allowed_origin,
            quota,
            prune_interval,
            upstream,
        })
    }
}

impl RuntimeConfig {
    /// Reads the completion service credential from the configured
    /// environment variable. Blank values count as absent.
    pub fn api_key_from_env(&self) -> Option<String> {
        std::env::var(&self.upstream.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}
