//! Server-mandated waits per host.
//!
//! A [`RateLimiter`] remembers the Retry-After a host sent and holds every
//! later request to that host until the wait is over, whichever worker makes
//! it. Different hosts never wait for each other. Regular spacing between a
//! worker's own requests is the job of [`WorkerPacer`](super::WorkerPacer).
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::fetch::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new();
//! limiter.acquire("https://example.org/a.pdf").await; // immediate
//! limiter.record_rate_limit("https://example.org/a.pdf", Duration::from_secs(2)).await;
//! limiter.acquire("https://example.org/b.pdf").await; // waits ~2s
//! limiter.acquire("https://other.org/c.pdf").await;   // immediate
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(60);

/// Upper bound for a server-mandated wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-host Retry-After state shared by every worker of a run.
#[derive(Debug, Default)]
pub struct RateLimiter {
    /// `Arc` values let callers drop the shard lock before awaiting the mutex.
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug, Default)]
struct HostState {
    /// Earliest instant the next request may start. `None` until the host asks to wait.
    next_slot: Mutex<Option<Instant>>,
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    #[allow(clippy::cast_possible_truncation)]
    fn add_delay(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        Duration::from_millis(self.cumulative_delay_ms.fetch_add(ms, Ordering::SeqCst) + ms)
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::default()))
            .clone()
    }

    /// Waits out any server-mandated delay recorded for `url`'s host.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());
        let state = self.state(&host);

        let next_slot = *state.next_slot.lock().await;
        if let Some(slot) = next_slot {
            let now = Instant::now();
            if slot > now {
                let delay = slot - now;
                let cumulative = state.add_delay(delay);
                debug!(%host, delay_ms = delay.as_millis(), "honoring server rate limit");
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD
                    && cumulative.saturating_sub(delay) < CUMULATIVE_DELAY_WARNING_THRESHOLD
                {
                    warn!(
                        %host,
                        cumulative_secs = cumulative.as_secs(),
                        "host keeps asking clients to slow down"
                    );
                }
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Records a server-mandated wait for `url`'s host.
    #[instrument(skip(self), fields(host))]
    pub async fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());
        let state = self.state(&host);

        let delay = delay.min(MAX_RETRY_AFTER);
        let candidate = Instant::now() + delay;
        let mut next_slot = state.next_slot.lock().await;
        if next_slot.is_none_or(|slot| slot < candidate) {
            *next_slot = Some(candidate);
        }
        debug!(%host, delay_ms = delay.as_millis(), "recorded server rate limit");
    }
}

/// Lowercased host of `url`, or `"unknown"` for unparseable input so that
/// malformed URLs still share one slot.
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After value: integer seconds or an HTTP date. Values are
/// capped at one hour; dates in the past yield zero.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let date = httpdate::parse_http_date(value).ok()?;
    Some(
        date.duration_since(std::time::SystemTime::now())
            .map_or(Duration::ZERO, |remaining| remaining.min(MAX_RETRY_AFTER)),
    )
}
