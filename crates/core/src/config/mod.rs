//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (RIPFETCH_*)
//! 2. TOML config file (if RIPFETCH_CONFIG_FILE set)
//! 3. Built-in defaults

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Pipeline configuration with layered loading.
///
/// All durations are in milliseconds. Loading precedence (highest wins):
/// 1. Environment variables (RIPFETCH_*)
/// 2. TOML config file (if RIPFETCH_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Maximum number of requests in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-task timeout inside the scheduler (none by default).
    #[serde(default)]
    pub queue_timeout_ms: Option<u64>,

    /// Admissions allowed per `rate_interval_ms` window. Must be set together
    /// with `rate_interval_ms`.
    #[serde(default)]
    pub rate_limit: Option<usize>,

    #[serde(default)]
    pub rate_interval_ms: Option<u64>,

    /// Maximum pooled connections per destination.
    #[serde(default = "default_pool_connections")]
    pub pool_connections: usize,

    /// Requested pipelining depth per connection.
    #[serde(default = "default_pool_pipelining")]
    pub pool_pipelining: usize,

    #[serde(default = "default_pool_keep_alive_timeout_ms")]
    pub pool_keep_alive_timeout_ms: u64,

    #[serde(default = "default_pool_connect_timeout_ms")]
    pub pool_connect_timeout_ms: u64,

    /// Maximum wait between two body reads.
    #[serde(default = "default_pool_io_timeout_ms")]
    pub pool_body_timeout_ms: u64,

    /// Maximum wait for the response head.
    #[serde(default = "default_pool_io_timeout_ms")]
    pub pool_headers_timeout_ms: u64,

    /// Overall deadline for a single fetch, including retries.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retries after the first attempt.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Consecutive retryable failures that open an origin's circuit.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default = "default_circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,

    /// Buffered output size that triggers a flush in the Markdown formatter.
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,

    /// Deadline for consuming a streamed body.
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,

    /// User-Agent string for HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum body bytes accepted per response.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Only these domains (and their subdomains) may be fetched, when non-empty.
    #[serde(default)]
    pub allowlist_domains: Vec<String>,

    /// These domains (and their subdomains) are never fetched.
    #[serde(default)]
    pub denylist_domains: Vec<String>,

    /// Permit literal loopback/private/reserved IP hosts.
    #[serde(default)]
    pub allow_private_addresses: bool,
}

fn default_concurrency() -> usize {
    10
}

fn default_pool_connections() -> usize {
    100
}

fn default_pool_pipelining() -> usize {
    1
}

fn default_pool_keep_alive_timeout_ms() -> u64 {
    4_000
}

fn default_pool_connect_timeout_ms() -> u64 {
    10_000
}

fn default_pool_io_timeout_ms() -> u64 {
    300_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_cooldown_ms() -> u64 {
    60_000
}

fn default_stream_chunk_size() -> usize {
    16_384
}

fn default_stream_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    "ripfetch/0.1".into()
}

fn default_max_bytes() -> usize {
    10_485_760 // 10MB
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_timeout_ms: None,
            rate_limit: None,
            rate_interval_ms: None,
            pool_connections: default_pool_connections(),
            pool_pipelining: default_pool_pipelining(),
            pool_keep_alive_timeout_ms: default_pool_keep_alive_timeout_ms(),
            pool_connect_timeout_ms: default_pool_connect_timeout_ms(),
            pool_body_timeout_ms: default_pool_io_timeout_ms(),
            pool_headers_timeout_ms: default_pool_io_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_cooldown_ms: default_circuit_breaker_cooldown_ms(),
            stream_chunk_size: default_stream_chunk_size(),
            stream_timeout_ms: default_stream_timeout_ms(),
            user_agent: default_user_agent(),
            max_bytes: default_max_bytes(),
            allowlist_domains: Vec::new(),
            denylist_domains: Vec::new(),
            allow_private_addresses: false,
        }
    }
}

impl AppConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_ms.map(Duration::from_millis)
    }

    /// The rate window as `(cap, interval)`, when both halves are set.
    pub fn rate_window(&self) -> Option<(usize, Duration)> {
        match (self.rate_limit, self.rate_interval_ms) {
            (Some(cap), Some(ms)) => Some((cap, Duration::from_millis(ms))),
            _ => None,
        }
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `RIPFETCH_`
    /// 2. TOML file from `RIPFETCH_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("RIPFETCH_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("RIPFETCH_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
