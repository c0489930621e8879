//! Shared retry policy for route attempts.
//!
//! One [`RetryPolicy`] is built per run and shared by the Direct route and
//! every mirror route. It is parameterized by the attempt bound, the backoff
//! schedule and the set of [`FailureType`]s that qualify for a retry.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::fetch::{FailureType, FetchError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
//! let failure = classify_error(&FetchError::http_status("https://example.org/a.pdf", 503));
//! assert_eq!(failure, FailureType::Transient);
//! assert!(matches!(policy.should_retry(failure, 1), RetryDecision::Retry { attempt: 2, .. }));
//! assert!(matches!(policy.should_retry(failure, 3), RetryDecision::DoNotRetry { .. }));
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::FetchError;

/// Default attempts per route, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(250);
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Failure classification used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureType {
    /// Timeouts, connection resets, 5xx responses.
    Transient,
    /// HTTP 429. Transient, with server-mandated pacing.
    RateLimited,
    /// 4xx other than 429, malformed URLs, oversize bodies, TLS failures.
    Permanent,
}

impl FailureType {
    /// Transient and rate-limited failures surface as `TransientFailure`.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Whether to try the same URL again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        /// Number of the attempt about to be made (the first retry is 2).
        attempt: u32,
    },
    DoNotRetry {
        reason: String,
    },
}

/// Bounded exponential backoff with jitter.
///
/// ```text
/// delay(attempt) = min(base * 2^(attempt - 1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
    retry_on: Vec<FailureType>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
            retry_on: vec![FailureType::Transient, FailureType::RateLimited],
        }
    }
}

impl RetryPolicy {
    /// Creates a policy retrying transient and rate-limited failures.
    ///
    /// Jitter is bounded by half of `base_delay` so short test schedules stay short.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            max_jitter: DEFAULT_MAX_JITTER.min(base_delay / 2),
            ..Self::default()
        }
    }

    /// Default schedule with a custom attempt bound.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Replaces the set of failure types that qualify for a retry.
    #[must_use]
    pub fn retrying_on(mut self, failure_types: &[FailureType]) -> Self {
        self.retry_on = failure_types.to_vec();
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn qualifies(&self, failure_type: FailureType) -> bool {
        self.retry_on.contains(&failure_type)
    }

    /// Decides whether the attempt numbered `attempt` (1-indexed) should be
    /// followed by another one.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if !self.qualifies(failure_type) {
            return RetryDecision::DoNotRetry {
                reason: format!("{failure_type:?} failures are not retried"),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.backoff(attempt);
        debug!(attempt, delay_ms = delay.as_millis(), "will retry");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_millis() as f64;
        let capped_ms = (base_ms * BACKOFF_MULTIPLIER.powi(exponent))
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + self.jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Classifies a fetch error.
///
/// | Error | Type |
/// |-------|------|
/// | 429 | RateLimited |
/// | 5xx | Transient |
/// | other status | Permanent |
/// | timeout | Transient |
/// | network (TLS) | Permanent |
/// | network (other) | Transient |
/// | invalid URL, oversize body, client build | Permanent |
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),
        FetchError::Timeout { .. } => FailureType::Transient,
        FetchError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        FetchError::InvalidUrl { .. }
        | FetchError::BodyTooLarge { .. }
        | FetchError::ClientBuild(_) => FailureType::Permanent,
    }
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let text = error.to_string().to_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| text.contains(needle))
}
