//! Outbound HTTP transport.
//!
//! The [`Transport`] trait is the seam between the resilience layers and the
//! network. Failures cross it as a structured [`TransportError`] and are only
//! classified further up, by [`crate::resilience::classify`].

pub mod pool;

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};

pub use pool::{PoolConfig, TransportPool};

/// Streamable response body. Dropping it releases the underlying connection.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Raw failures at the transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Deadline elapsed while connecting or reading.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The call was aborted before completing.
    #[error("request cancelled")]
    Cancelled,

    /// Hostname resolution failed.
    #[error("dns resolution failed: {0}")]
    Dns(String),

    /// Socket-level failure.
    #[error("connection failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failure without structured detail; classified by message.
    #[error("{0}")]
    Other(String),
}

/// A single GET request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

impl TransportRequest {
    pub fn get(url: Url) -> Self {
        Self { url, headers: HeaderMap::new() }
    }
}

/// Response head plus a lazily-read body.
pub struct TransportResponse {
    pub status: StatusCode,
    /// The final URL after redirects
    pub final_url: Url,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("final_url", &self.final_url.as_str())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    /// Content-Type header, if present and valid UTF-8.
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

/// Something that can perform an HTTP GET and hand back a streaming body.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn perform(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}
