//! Typed errors for outbound HTTP fetches.

use thiserror::Error;

/// Failure kinds surfaced by the HTTP gateway. Every outbound request
/// resolves to exactly one of these on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    BlockedUrl,
    DnsFailure,
    TransportError,
    Status4xx,
    Status5xx,
    Timeout,
    Oversize,
    ContentMismatch,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::BlockedUrl => "blocked_url",
            FetchErrorKind::DnsFailure => "dns_failure",
            FetchErrorKind::TransportError => "transport_error",
            FetchErrorKind::Status4xx => "status_4xx",
            FetchErrorKind::Status5xx => "status_5xx",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Oversize => "oversize",
            FetchErrorKind::ContentMismatch => "content_mismatch",
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// URL scheme, fragment, or target address is disallowed.
    #[error("blocked URL: {0}")]
    BlockedUrl(String),

    /// Hostname did not resolve.
    #[error("DNS resolution failed for {host}: {detail}")]
    DnsFailure { host: String, detail: String },

    /// Connection-level failure (reset, TLS, protocol).
    #[error("transport error for {url}: {detail}")]
    TransportError { url: String, detail: String },

    /// Non-retryable client error status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// Attempt exceeded its wall-clock limit.
    #[error("timeout fetching {0}")]
    Timeout(String),

    /// Response body exceeded the size cap.
    #[error("response for {url} exceeded {limit} bytes")]
    Oversize { url: String, limit: u64 },

    /// Downloaded content did not match the expected mime type.
    #[error("content mismatch for {url}: expected {expected}, got {actual}")]
    ContentMismatch {
        url: String,
        expected: String,
        actual: String,
    },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::BlockedUrl(_) => FetchErrorKind::BlockedUrl,
            FetchError::DnsFailure { .. } => FetchErrorKind::DnsFailure,
            FetchError::TransportError { .. } => FetchErrorKind::TransportError,
            FetchError::Status { status, .. } if *status >= 500 => FetchErrorKind::Status5xx,
            FetchError::Status { .. } => FetchErrorKind::Status4xx,
            FetchError::Timeout(_) => FetchErrorKind::Timeout,
            FetchError::Oversize { .. } => FetchErrorKind::Oversize,
            FetchError::ContentMismatch { .. } => FetchErrorKind::ContentMismatch,
        }
    }

    /// Transient failures are worth retrying; the rest are permanent for
    /// the URL in question.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::TransportError { .. } | FetchError::Timeout(_) => true,
            FetchError::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            FetchError::DnsFailure { .. } => true,
            FetchError::BlockedUrl(_)
            | FetchError::Oversize { .. }
            | FetchError::ContentMismatch { .. } => false,
        }
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let e = FetchError::Status {
            status: 503,
            url: "https://example.fi".into(),
        };
        assert_eq!(e.kind(), FetchErrorKind::Status5xx);
        assert!(e.is_transient());

        let e = FetchError::Status {
            status: 404,
            url: "https://example.fi".into(),
        };
        assert_eq!(e.kind(), FetchErrorKind::Status4xx);
        assert!(!e.is_transient());

        let e = FetchError::Status {
            status: 429,
            url: "https://example.fi".into(),
        };
        assert!(e.is_transient());
    }

    #[test]
    fn permanent_kinds_are_not_transient() {
        assert!(!FetchError::BlockedUrl("http://10.0.0.1/".into()).is_transient());
        assert!(!FetchError::Oversize {
            url: "https://example.fi/big.pdf".into(),
            limit: 10_000_000,
        }
        .is_transient());
    }
}
