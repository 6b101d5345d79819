//! Client code for ripfetch.
//!
//! This crate provides the resilient fetch pipeline (connection pool, request
//! scheduler, per-origin circuit breaker, retry with backoff) and streaming
//! HTML to Markdown conversion.

pub mod extract;
pub mod fetch;
pub mod resilience;
pub mod transport;

pub use extract::{MarkdownChunks, MarkdownOptions, html_to_markdown, html_to_markdown_str, html_to_markdown_stream};
pub use fetch::{BodyChunks, FetchClient, FetchConfig, FetchOptions, FetchPolicy, FetchStream, RequestIdentity};
pub use resilience::{CircuitBreaker, CircuitState, RequestScheduler, RetryPolicy};
pub use transport::{Transport, TransportError, TransportPool};
