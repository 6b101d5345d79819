//! Normalizes user-supplied URLs before they reach the pipeline.

use ripfetch_core::ClassifiedError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    Invalid(String),
}

impl From<UrlError> for ClassifiedError {
    fn from(err: UrlError) -> Self {
        ClassifiedError::policy_blocked(err.to_string())
    }
}

/// Canonical form of `input`.
///
/// Trims whitespace, assumes `https://` when no scheme is given, accepts only
/// http and https, and drops the fragment. The host is lowercased by the URL
/// parser; the query string is kept as-is.
pub fn canonicalize(input: &str) -> Result<url::Url, UrlError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let with_scheme = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };
    let mut parsed = url::Url::parse(&with_scheme).map_err(|e| UrlError::Invalid(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(UrlError::Invalid(format!("no host in {trimmed}")));
    }

    parsed.set_fragment(None);
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripfetch_core::ErrorKind;

    #[test]
    fn test_canonicalize_defaults_to_https() {
        let url = canonicalize("example.com/docs").unwrap();
        assert_eq!(url.as_str(), "https://example.com/docs");
    }

    #[test]
    fn test_canonicalize_lowercases_host_and_drops_fragment() {
        let url = canonicalize("  HTTP://Example.COM/Path?b=2&a=1#top ").unwrap();
        assert_eq!(url.as_str(), "http://example.com/Path?b=2&a=1");
    }

    #[test]
    fn test_canonicalize_rejects() {
        assert_eq!(canonicalize("   "), Err(UrlError::Empty));
        assert_eq!(canonicalize("file:///etc/passwd"), Err(UrlError::UnsupportedScheme("file".into())));
        assert_eq!(canonicalize("ftp://example.com"), Err(UrlError::UnsupportedScheme("ftp".into())));
        assert!(matches!(canonicalize("https://exa mple.com"), Err(UrlError::Invalid(_))));
    }

    #[test]
    fn test_url_error_is_policy_blocked() {
        let err: ClassifiedError = UrlError::Empty.into();
        assert_eq!(err.kind(), ErrorKind::PolicyBlocked);
        assert!(!err.retryable());
    }
}
