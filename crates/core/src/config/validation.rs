//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `concurrency`, `pool_connections`, `pool_pipelining`, `stream_chunk_size`,
    ///   `max_bytes` or `circuit_breaker_threshold` is 0
    /// - only one of `rate_limit` / `rate_interval_ms` is set, or either is 0
    /// - `retry_initial_delay_ms` exceeds `retry_max_delay_ms`
    /// - `request_timeout_ms` or `stream_timeout_ms` is below 100ms
    /// - `user_agent` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be greater than 0"));
        }
        if self.pool_connections == 0 {
            return Err(invalid("pool_connections", "must be greater than 0"));
        }
        if self.pool_pipelining == 0 {
            return Err(invalid("pool_pipelining", "must be greater than 0"));
        }

        match (self.rate_limit, self.rate_interval_ms) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(invalid("rate_limit", "rate_limit and rate_interval_ms must be set together"));
            }
            (Some(0), _) => return Err(invalid("rate_limit", "must be greater than 0")),
            (_, Some(0)) => return Err(invalid("rate_interval_ms", "must be greater than 0")),
            _ => {}
        }

        if self.queue_timeout_ms == Some(0) {
            return Err(invalid("queue_timeout_ms", "must be greater than 0 when set"));
        }

        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(invalid("retry_initial_delay_ms", "must not exceed retry_max_delay_ms"));
        }

        if self.circuit_breaker_threshold == 0 {
            return Err(invalid("circuit_breaker_threshold", "must be greater than 0"));
        }

        if self.request_timeout_ms < 100 {
            return Err(invalid("request_timeout_ms", "must be at least 100ms"));
        }
        if self.stream_timeout_ms < 100 {
            return Err(invalid("stream_timeout_ms", "must be at least 100ms"));
        }

        if self.stream_chunk_size == 0 {
            return Err(invalid("stream_chunk_size", "must be greater than 0"));
        }
        if self.max_bytes == 0 {
            return Err(invalid("max_bytes", "must be greater than 0"));
        }

        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        if self.pool_pipelining > 1 {
            tracing::warn!(
                pool_pipelining = self.pool_pipelining,
                "HTTP/1 pipelining is not supported by the transport; requests multiplex over HTTP/2 instead"
            );
        }

        if !self.allowlist_domains.is_empty() && !self.denylist_domains.is_empty() {
            tracing::warn!(
                allowlist_count = self.allowlist_domains.len(),
                denylist_count = self.denylist_domains.len(),
                "Both allowlist_domains and denylist_domains are set; \
                 denylist is checked first"
            );
        }

        Ok(())
    }
}
