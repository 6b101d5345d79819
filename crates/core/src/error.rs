//! Classified error taxonomy for the fetch pipeline.
//!
//! Every raw failure is normalized into a [`ClassifiedError`] before it crosses
//! a component boundary. Once produced, `kind` and `retryable` never change.

use std::fmt;
use std::sync::Arc;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Request or read exceeded its deadline.
    NetworkTimeout,
    /// Hostname could not be resolved.
    DnsFailure,
    /// Refused, reset, broken pipe and other socket-level failures.
    ConnectionError,
    /// HTTP 4xx response.
    ClientError,
    /// HTTP 5xx response.
    ServerError,
    /// Origin circuit is open; the transport was not called.
    CircuitOpen,
    /// Blocked by fetch policy (denylist, private address, size cap).
    PolicyBlocked,
    /// Cancelled by the caller.
    Cancelled,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Whether failures of this kind are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout | ErrorKind::ConnectionError | ErrorKind::ServerError | ErrorKind::Unknown
        )
    }

    /// Stable upper-case code used in display output.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorKind::DnsFailure => "DNS_FAILURE",
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::ClientError => "CLIENT_ERROR_4XX",
            ErrorKind::ServerError => "SERVER_ERROR_5XX",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::PolicyBlocked => "POLICY_BLOCKED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

type Source = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A failure normalized into the taxonomy.
///
/// Cheap to clone; the underlying cause is shared.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    retryable: bool,
    status: Option<u16>,
    message: String,
    url: Option<String>,
    #[source]
    source: Option<Source>,
}

impl ClassifiedError {
    /// Create an error whose retryability follows the kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, retryable: kind.is_retryable(), status: None, message: message.into(), url: None, source: None }
    }

    /// Attach the URL the failure relates to.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Attach the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Build the error for a non-success HTTP status.
    ///
    /// - `[400, 500)` → [`ErrorKind::ClientError`], not retryable
    /// - `[500, 600)` → [`ErrorKind::ServerError`], retryable
    /// - anything else → [`ErrorKind::Unknown`], not retryable
    pub fn http(url: &str, status: u16, status_text: &str) -> Self {
        let message = if status_text.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status} {status_text}")
        };

        let (kind, retryable) = match status {
            400..=499 => (ErrorKind::ClientError, false),
            500..=599 => (ErrorKind::ServerError, true),
            _ => (ErrorKind::Unknown, false),
        };

        Self { kind, retryable, status: Some(status), message, url: Some(url.to_string()), source: None }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkTimeout, message)
    }

    pub fn circuit_open(origin: &str) -> Self {
        Self::new(ErrorKind::CircuitOpen, format!("circuit open for {origin}")).with_url(origin)
    }

    pub fn policy_blocked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyBlocked, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    /// HTTP status, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Sanitized message safe to show to end users.
    ///
    /// Never includes the raw cause, URLs, paths, or credentials.
    pub fn to_user_message(&self) -> String {
        match self.kind {
            ErrorKind::NetworkTimeout => "The request timed out. Please try again later.".to_string(),
            ErrorKind::DnsFailure => "The website address could not be found.".to_string(),
            ErrorKind::ConnectionError => "Could not connect to the website.".to_string(),
            ErrorKind::ClientError => match self.status {
                Some(status) => format!("The website rejected the request (HTTP {status})."),
                None => "The website rejected the request.".to_string(),
            },
            ErrorKind::ServerError => match self.status {
                Some(status) => format!("The website had a server error (HTTP {status})."),
                None => "The website had a server error.".to_string(),
            },
            ErrorKind::CircuitOpen => {
                "The website is temporarily unavailable after repeated failures. Please try again later.".to_string()
            }
            ErrorKind::PolicyBlocked => "Access to this address is not allowed.".to_string(),
            ErrorKind::Cancelled => "The request was cancelled.".to_string(),
            ErrorKind::Unknown => "An unexpected error occurred while fetching the page.".to_string(),
        }
    }
}
