//! Bounded HTTP retrieval with outcome classification.
//!
//! The [`Fetcher`] performs one route attempt for a URL: honoring server
//! rate limits through the caller's [`RateLimiter`], a bounded in-memory body
//! read, and the shared [`RetryPolicy`] micro-retry for transient failures.
//! It never touches disk.
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::fetch::{FetchContext, Fetcher, FetcherOptions, RateLimiter, RetryPolicy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = Fetcher::new(&FetcherOptions::default(), RetryPolicy::default())?;
//! let limiter = RateLimiter::new();
//! let report = fetcher
//!     .fetch("https://example.org/paper.pdf", FetchContext::new(&limiter))
//!     .await;
//! println!("attempts: {}", report.attempts);
//! # Ok(())
//! # }
//! ```

mod error;
mod pacer;
pub mod rate_limiter;
mod retry;

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::task::{AttemptOutcome, FailureReason};
use crate::user_agent;

pub use error::FetchError;
pub use pacer::WorkerPacer;
pub use rate_limiter::{RateLimiter, extract_host, parse_retry_after};
pub use retry::{DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Connect timeout used for every request.
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Timeout for the content-type pre-check.
pub const HEAD_TIMEOUT_SECS: u64 = 10;

/// Default bound on a single response body.
pub const DEFAULT_MAX_BODY_BYTES: u64 = 200 * 1024 * 1024;

/// Longest Retry-After waited out inside one route attempt. A server asking
/// for more ends the attempt; the host stays held for later requests.
pub const MAX_IN_RETRY_WAIT: Duration = Duration::from_secs(10);

/// Accept header sent when the caller expects a PDF.
pub const PDF_ACCEPT: &str = "application/pdf,*/*;q=0.8";

/// Declared types that never carry a paper full-text.
const UNUSABLE_TYPE_PREFIXES: &[&str] = &["image/", "audio/", "video/", "font/"];
const UNUSABLE_TYPES: &[&str] = &[
    "text/css",
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
    "application/zip",
    "application/x-rar-compressed",
    "application/x-7z-compressed",
    "application/gzip",
    "application/x-tar",
];

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_body_bytes: u64,
    pub user_agent: String,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            user_agent: user_agent::default_user_agent(),
        }
    }
}

/// Per-call pacing and header overrides.
#[derive(Debug, Clone, Copy)]
pub struct FetchContext<'a> {
    pub limiter: &'a RateLimiter,
    pub user_agent: Option<&'a str>,
    /// Expected-type hint sent as the `Accept` header.
    pub accept: Option<&'a str>,
}

impl<'a> FetchContext<'a> {
    #[must_use]
    pub fn new(limiter: &'a RateLimiter) -> Self {
        Self {
            limiter,
            user_agent: None,
            accept: None,
        }
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: &'a str) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    #[must_use]
    pub fn expecting(mut self, accept: &'a str) -> Self {
        self.accept = Some(accept);
        self
    }
}

/// A fully read response body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    /// URL after redirects.
    pub final_url: String,
    /// Declared `Content-Type`, advisory only.
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Result of a route fetch including micro-retries.
#[derive(Debug)]
pub struct FetchReport {
    pub result: Result<FetchedBody, FetchError>,
    /// Requests made, at least one.
    pub attempts: u32,
}

impl FetchReport {
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Shared HTTP fetcher. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    max_body_bytes: u64,
    retry_policy: RetryPolicy,
}

impl Fetcher {
    /// Builds the underlying HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] if reqwest rejects the configuration.
    pub fn new(options: &FetcherOptions, retry_policy: RetryPolicy) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.timeout)
            .gzip(true)
            .cookie_store(true)
            .user_agent(options.user_agent.as_str())
            .build()
            .map_err(FetchError::ClientBuild)?;
        debug!(
            timeout_secs = options.timeout.as_secs(),
            max_attempts = retry_policy.max_attempts(),
            "created fetcher"
        );
        Ok(Self {
            client,
            max_body_bytes: options.max_body_bytes,
            retry_policy,
        })
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Fetches `url` with pacing and micro-retry.
    #[instrument(skip(self, ctx), fields(url = %url))]
    pub async fn fetch(&self, url: &str, ctx: FetchContext<'_>) -> FetchReport {
        let mut attempt = 1;
        loop {
            ctx.limiter.acquire(url).await;
            let error = match self.fetch_once(url, ctx.user_agent, ctx.accept).await {
                Ok(body) => {
                    return FetchReport {
                        result: Ok(body),
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            let failure = classify_error(&error);
            if failure == FailureType::RateLimited
                && let Some(server_delay) = retry_after(&error)
            {
                ctx.limiter.record_rate_limit(url, server_delay).await;
                if server_delay > MAX_IN_RETRY_WAIT {
                    debug!(
                        attempt,
                        retry_after_secs = server_delay.as_secs(),
                        "server asked for a long wait, giving up on URL"
                    );
                    return FetchReport {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
            }

            match self.retry_policy.should_retry(failure, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    debug!(error = %error, attempt, delay_ms = delay.as_millis(), "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(error = %error, attempt, %reason, "giving up on URL");
                    return FetchReport {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// One GET request with a bounded body read.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] describing the failed request.
    pub async fn fetch_once(
        &self,
        url: &str,
        user_agent: Option<&str>,
        accept: Option<&str>,
    ) -> Result<FetchedBody, FetchError> {
        let parsed = parse_http_url(url)?;

        let mut request = self.client.get(parsed);
        if let Some(ua) = user_agent {
            request = request.header(USER_AGENT, ua);
        }
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        let response = request.send().await.map_err(|e| request_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            return Err(FetchError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        let declared_len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        if declared_len.is_some_and(|len| len > self.max_body_bytes) {
            return Err(FetchError::body_too_large(url, self.max_body_bytes));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = read_bounded(response, url, self.max_body_bytes).await?;
        debug!(bytes = body.len(), content_type = ?content_type, "fetched body");

        Ok(FetchedBody {
            final_url,
            content_type,
            body,
        })
    }

    /// Declared `Content-Type` from a HEAD request. Any failure yields `None`
    /// so the pre-check never blocks a download on its own.
    #[instrument(skip(self, limiter), fields(url = %url))]
    pub async fn head_content_type(&self, url: &str, limiter: &RateLimiter) -> Option<String> {
        let parsed = parse_http_url(url).ok()?;
        limiter.acquire(url).await;
        let response = match self
            .client
            .head(parsed)
            .timeout(Duration::from_secs(HEAD_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                debug!(error = %error, "HEAD request failed, skipping pre-check");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(status = response.status().as_u16(), "HEAD not successful, skipping pre-check");
            return None;
        }
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }
}

/// Maps a failed fetch to the attempt outcome it represents.
#[must_use]
pub fn failure_outcome(error: &FetchError) -> AttemptOutcome {
    let reason = FailureReason::new(error.code(), error.to_string());
    if classify_error(error).is_transient() {
        AttemptOutcome::TransientFailure(reason)
    } else {
        AttemptOutcome::PermanentFailure(reason)
    }
}

/// True when a declared type can never be a paper full-text.
#[must_use]
pub fn is_unusable_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    UNUSABLE_TYPE_PREFIXES
        .iter()
        .any(|prefix| mime.starts_with(prefix))
        || UNUSABLE_TYPES.contains(&mime.as_str())
}

fn parse_http_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url.trim()).map_err(|_| FetchError::invalid_url(url))?;
    if matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some() {
        Ok(parsed)
    } else {
        Err(FetchError::invalid_url(url))
    }
}

fn request_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else {
        FetchError::network(url, error)
    }
}

fn retry_after(error: &FetchError) -> Option<Duration> {
    match error {
        FetchError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

async fn read_bounded(
    response: reqwest::Response,
    url: &str,
    limit: u64,
) -> Result<Vec<u8>, FetchError> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| request_error(url, e))?;
        if (body.len() + chunk.len()) as u64 > limit {
            warn!(url, limit, "response body exceeds limit, aborting");
            return Err(FetchError::body_too_large(url, limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{headers, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn quick_fetcher(max_attempts: u32) -> Fetcher {
        Fetcher::new(
            &FetcherOptions::default(),
            RetryPolicy::new(max_attempts, Duration::from_millis(5), Duration::from_millis(20)),
        )
        .unwrap()
    }

    #[test]
    fn test_unusable_content_types() {
        assert!(is_unusable_content_type("image/png"));
        assert!(is_unusable_content_type("Video/MP4; codecs=x"));
        assert!(is_unusable_content_type("text/css"));
        assert!(!is_unusable_content_type("application/pdf"));
        assert!(!is_unusable_content_type("text/html; charset=utf-8"));
        assert!(!is_unusable_content_type("application/octet-stream"));
    }

    #[test]
    fn test_failure_outcome_mapping() {
        assert!(matches!(
            failure_outcome(&FetchError::http_status("u", 503)),
            AttemptOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            failure_outcome(&FetchError::http_status("u", 429)),
            AttemptOutcome::TransientFailure(_)
        ));
        match failure_outcome(&FetchError::http_status("u", 404)) {
            AttemptOutcome::PermanentFailure(reason) => assert_eq!(reason.code, "http_404"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_url_is_permanent_without_request() {
        let fetcher = quick_fetcher(3);
        let limiter = RateLimiter::new();
        let report = fetcher.fetch("not a url", FetchContext::new(&limiter)).await;
        assert_eq!(report.attempts, 1);
        assert!(matches!(report.result, Err(FetchError::InvalidUrl { .. })));

        let report = fetcher.fetch("ftp://example.org/a", FetchContext::new(&limiter)).await;
        assert!(matches!(report.result, Err(FetchError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_declared_type() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/paper.pdf"))
            .and(headers("accept", vec!["application/pdf", "*/*;q=0.8"]))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(b"%PDF-1.4 data".to_vec()),
            )
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(3);
        let limiter = RateLimiter::new();
        let url = format!("{}/paper.pdf", server.uri());
        let report = fetcher
            .fetch(&url, FetchContext::new(&limiter).expecting(PDF_ACCEPT))
            .await;
        let body = report.result.unwrap();
        assert_eq!(body.body, b"%PDF-1.4 data");
        assert_eq!(body.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_up_to_bound() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(3);
        let limiter = RateLimiter::new();
        let report = fetcher
            .fetch(&format!("{}/flaky", server.uri()), FetchContext::new(&limiter))
            .await;
        assert_eq!(report.attempts, 3);
        assert_eq!(report.retries(), 2);
        assert!(matches!(
            report.result,
            Err(FetchError::HttpStatus { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_short_retry_after_is_honored_then_retried() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 data".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(3);
        let limiter = RateLimiter::new();
        let start = std::time::Instant::now();
        let report = fetcher
            .fetch(&format!("{}/busy", server.uri()), FetchContext::new(&limiter))
            .await;
        assert!(report.result.is_ok());
        assert_eq!(report.retries(), 1);
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_long_retry_after_ends_attempt_without_waiting() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/throttled"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(3);
        let limiter = RateLimiter::new();
        let start = std::time::Instant::now();
        let report = fetcher
            .fetch(&format!("{}/throttled", server.uri()), FetchContext::new(&limiter))
            .await;
        assert!(start.elapsed() < MAX_IN_RETRY_WAIT);
        assert_eq!(report.attempts, 1);
        let error = report.result.unwrap_err();
        assert!(matches!(error, FetchError::HttpStatus { status: 429, .. }));
        assert!(matches!(failure_outcome(&error), AttemptOutcome::TransientFailure(_)));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(3);
        let limiter = RateLimiter::new();
        let report = fetcher
            .fetch(&format!("{}/missing", server.uri()), FetchContext::new(&limiter))
            .await;
        assert_eq!(report.attempts, 1);
        assert!(matches!(
            report.result,
            Err(FetchError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_oversize_body_is_rejected() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'a'; 4096]))
            .mount(&server)
            .await;

        let options = FetcherOptions {
            max_body_bytes: 1024,
            ..FetcherOptions::default()
        };
        let fetcher = Fetcher::new(&options, RetryPolicy::with_max_attempts(1)).unwrap();
        let limiter = RateLimiter::new();
        let report = fetcher
            .fetch(&format!("{}/big", server.uri()), FetchContext::new(&limiter))
            .await;
        assert!(matches!(report.result, Err(FetchError::BodyTooLarge { limit: 1024, .. })));
    }

    #[tokio::test]
    async fn test_head_content_type() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .and(path("/figure"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "image/png"))
            .mount(&server)
            .await;

        let fetcher = quick_fetcher(1);
        let limiter = RateLimiter::new();
        let declared = fetcher
            .head_content_type(&format!("{}/figure", server.uri()), &limiter)
            .await;
        assert_eq!(declared.as_deref(), Some("image/png"));

        let missing = fetcher
            .head_content_type(&format!("{}/nothing", server.uri()), &limiter)
            .await;
        assert!(missing.is_none());
    }
}
