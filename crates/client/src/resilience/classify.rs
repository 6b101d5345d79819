//! Maps raw transport failures onto the [`ErrorKind`] taxonomy.
//!
//! Structured signals (variant, `reqwest::Error` flags, `io::ErrorKind` found
//! anywhere in the source chain) win. Message-substring rules are the last
//! resort and are pinned by the characterization tests below.
//!
//! Precedence, first match wins:
//! 1. cancellation → `Cancelled`
//! 2. timeout → `NetworkTimeout`
//! 3. name resolution → `DnsFailure`
//! 4. refused/reset/broken pipe/socket/network → `ConnectionError`
//! 5. anything else → `Unknown` (retryable)

use std::error::Error as StdError;
use std::io;

use ripfetch_core::{ClassifiedError, ErrorKind};

use crate::transport::TransportError;

const CANCEL_MARKERS: &[&str] = &["cancelled", "canceled", "operation was aborted", "aborterror", "request aborted"];

const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline has elapsed", "etimedout"];

const DNS_MARKERS: &[&str] = &[
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "no such host",
    "nodename nor servname",
    "temporary failure in name resolution",
    "enotfound",
    "eai_again",
];

const CONNECTION_MARKERS: &[&str] = &[
    "connection refused",
    "econnrefused",
    "connection reset",
    "econnreset",
    "connection closed",
    "connection aborted",
    "broken pipe",
    "epipe",
    "socket",
    "network",
    "unreachable",
    "error trying to connect",
    "tcp connect error",
];

/// Classify a transport failure for `url`.
pub fn classify(err: TransportError, url: &str) -> ClassifiedError {
    let chain = chain_text(&err);
    let kind = structured_kind(&err).unwrap_or_else(|| kind_from_message(&chain));

    tracing::debug!(%url, %kind, error = %chain, "classified transport failure");

    ClassifiedError::new(kind, chain).with_url(url).with_source(err)
}

fn structured_kind(err: &TransportError) -> Option<ErrorKind> {
    match err {
        TransportError::Cancelled => Some(ErrorKind::Cancelled),
        TransportError::Timeout(_) => Some(ErrorKind::NetworkTimeout),
        TransportError::Dns(_) => Some(ErrorKind::DnsFailure),
        TransportError::Connect(_) => Some(ErrorKind::ConnectionError),
        TransportError::Io(e) => io_kind(e),
        TransportError::Http(e) => {
            if e.is_timeout() {
                return Some(ErrorKind::NetworkTimeout);
            }
            if let Some(kind) = find_io_kind(e) {
                return Some(kind);
            }
            // A connect error is either DNS or socket level; only the message tells them apart.
            if e.is_connect() {
                let text = chain_text(e);
                return Some(match kind_from_message(&text) {
                    ErrorKind::Unknown => ErrorKind::ConnectionError,
                    kind => kind,
                });
            }
            None
        }
        TransportError::Other(_) => None,
    }
}

fn io_kind(e: &io::Error) -> Option<ErrorKind> {
    match e.kind() {
        io::ErrorKind::TimedOut => Some(ErrorKind::NetworkTimeout),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(ErrorKind::ConnectionError),
        _ => None,
    }
}

fn find_io_kind(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    let mut current = err.source();
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<io::Error>()
            && let Some(kind) = io_kind(io)
        {
            return Some(kind);
        }
        current = e.source();
    }
    None
}

/// Last-resort classification from case-insensitive message text.
pub fn kind_from_message(message: &str) -> ErrorKind {
    let text = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| text.contains(m));

    if has(CANCEL_MARKERS) {
        ErrorKind::Cancelled
    } else if has(TIMEOUT_MARKERS) {
        ErrorKind::NetworkTimeout
    } else if has(DNS_MARKERS) {
        ErrorKind::DnsFailure
    } else if has(CONNECTION_MARKERS) {
        ErrorKind::ConnectionError
    } else {
        ErrorKind::Unknown
    }
}

/// The error's display text followed by every source, joined with `: `.
fn chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        let part = e.to_string();
        if !text.contains(&part) {
            text.push_str(": ");
            text.push_str(&part);
        }
        current = e.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/page";

    #[test]
    fn test_structured_variants() {
        assert_eq!(classify(TransportError::Cancelled, URL).kind(), ErrorKind::Cancelled);
        assert_eq!(classify(TransportError::Timeout("head".into()), URL).kind(), ErrorKind::NetworkTimeout);
        assert_eq!(classify(TransportError::Dns("x".into()), URL).kind(), ErrorKind::DnsFailure);
        assert_eq!(classify(TransportError::Connect("x".into()), URL).kind(), ErrorKind::ConnectionError);
    }

    #[test]
    fn test_retryable_follows_kind() {
        assert!(!classify(TransportError::Cancelled, URL).retryable());
        assert!(classify(TransportError::Timeout("x".into()), URL).retryable());
        assert!(!classify(TransportError::Dns("x".into()), URL).retryable());
        assert!(classify(TransportError::Connect("x".into()), URL).retryable());
        assert!(classify(TransportError::Other("mystery".into()), URL).retryable());
    }

    #[test]
    fn test_io_error_kinds() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify(TransportError::Io(refused), URL).kind(), ErrorKind::ConnectionError);

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify(TransportError::Io(timed_out), URL).kind(), ErrorKind::NetworkTimeout);

        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(classify(TransportError::Io(pipe), URL).kind(), ErrorKind::ConnectionError);
    }

    #[test]
    fn test_io_error_falls_back_to_message() {
        let err = io::Error::other("failed to lookup address information: Name or service not known");
        assert_eq!(classify(TransportError::Io(err), URL).kind(), ErrorKind::DnsFailure);
    }

    // Characterization of messages produced by hyper, reqwest, tokio and libc.
    #[test]
    fn test_message_rules() {
        let cases = [
            ("operation was cancelled", ErrorKind::Cancelled),
            ("request aborted by caller", ErrorKind::Cancelled),
            ("deadline has elapsed", ErrorKind::NetworkTimeout),
            ("operation timed out", ErrorKind::NetworkTimeout),
            ("connect ETIMEDOUT 10.0.0.1:443", ErrorKind::NetworkTimeout),
            ("dns error: failed to lookup address information", ErrorKind::DnsFailure),
            ("getaddrinfo ENOTFOUND nope.invalid", ErrorKind::DnsFailure),
            ("Temporary failure in name resolution", ErrorKind::DnsFailure),
            ("tcp connect error: Connection refused (os error 111)", ErrorKind::ConnectionError),
            ("Connection reset by peer (os error 104)", ErrorKind::ConnectionError),
            ("Broken pipe (os error 32)", ErrorKind::ConnectionError),
            ("socket hang up", ErrorKind::ConnectionError),
            ("Network is unreachable (os error 101)", ErrorKind::ConnectionError),
            ("invalid chunk size", ErrorKind::Unknown),
        ];

        for (message, expected) in cases {
            assert_eq!(kind_from_message(message), expected, "message: {message}");
        }
    }

    #[test]
    fn test_precedence_cancel_over_timeout() {
        assert_eq!(kind_from_message("request cancelled after timeout"), ErrorKind::Cancelled);
    }

    #[test]
    fn test_precedence_timeout_over_connection() {
        assert_eq!(kind_from_message("socket timed out"), ErrorKind::NetworkTimeout);
    }

    #[test]
    fn test_precedence_dns_over_connection() {
        assert_eq!(
            kind_from_message("error trying to connect: dns error: no such host"),
            ErrorKind::DnsFailure
        );
    }

    #[test]
    fn test_classified_error_keeps_url_and_source() {
        let err = classify(TransportError::Other("weird".into()), URL);
        assert_eq!(err.url(), Some(URL));
        assert!(StdError::source(&err).is_some());
        assert_eq!(err.message(), "weird");
    }

    #[tokio::test]
    async fn test_reqwest_connect_error_is_connection_error() {
        let http = reqwest::Client::new();
        let err = http.get("http://127.0.0.1:9/").send().await.unwrap_err();
        let classified = classify(TransportError::Http(err), "http://127.0.0.1:9/");
        assert_eq!(classified.kind(), ErrorKind::ConnectionError);
        assert!(classified.retryable());
    }
}
