//! Error types for single retrieval attempts.

use thiserror::Error;

/// Errors produced by one HTTP retrieval attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The request did not complete within the per-request timeout.
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// Non-success HTTP status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Raw Retry-After header, kept for 429 pacing.
        retry_after: Option<String>,
    },

    /// The URL is malformed or not http(s).
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// The body exceeded the configured size bound.
    #[error("response from {url} exceeds {limit} bytes")]
    BodyTooLarge { url: String, limit: u64 },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl FetchError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn body_too_large(url: impl Into<String>, limit: u64) -> Self {
        Self::BodyTooLarge {
            url: url.into(),
            limit,
        }
    }

    /// Short machine-readable code used as the failure reason code.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::Network { .. } => "network".to_string(),
            Self::Timeout { .. } => "timeout".to_string(),
            Self::HttpStatus { status, .. } => format!("http_{status}"),
            Self::InvalidUrl { .. } => "invalid_url".to_string(),
            Self::BodyTooLarge { .. } => "body_too_large".to_string(),
            Self::ClientBuild(_) => "client_build".to_string(),
        }
    }
}
