//! Per-run counters and the run summary report.
//!
//! Counters are additive and order-independent, so workers update them
//! without coordination. They are reset per run and never consulted for
//! resumption; the ledger is authoritative.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::instrument;

use crate::ledger::LedgerStatus;
use crate::task::{AttemptOutcome, OutcomeCategory, RouteAttempt};
use crate::verify::{EffectiveType, RejectReason};

/// File name of the summary under the output root.
pub const SUMMARY_FILE: &str = "run_summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct AttemptKey {
    outcome: OutcomeCategory,
    effective_type: Option<EffectiveType>,
    route: String,
}

/// Shared run counters.
#[derive(Debug, Default)]
pub struct RunStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    retries: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    attempts: DashMap<AttemptKey, usize>,
}

/// Keeps a chain counted as in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    stats: &'a RunStats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RunStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a chain as past dispatch and before finalize.
    #[must_use]
    pub fn enter_chain(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { stats: self }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous chains observed in this run.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Counts one route attempt and its micro-retries.
    pub fn record_attempt(&self, attempt: &RouteAttempt) {
        let key = AttemptKey {
            outcome: attempt.outcome.category(),
            effective_type: observed_type(&attempt.outcome),
            route: attempt.route.label(),
        };
        *self.attempts.entry(key).or_insert(0) += 1;
        let retries = usize::try_from(attempt.retries).unwrap_or(usize::MAX);
        self.retries.fetch_add(retries, Ordering::SeqCst);
    }

    /// Counts a task's terminal status.
    pub fn record_terminal(&self, status: LedgerStatus) {
        let counter = match status {
            LedgerStatus::Completed => &self.completed,
            LedgerStatus::Failed => &self.failed,
            LedgerStatus::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Tasks finalized so far in this run.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.completed() + self.failed() + self.skipped()
    }

    #[must_use]
    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::SeqCst)
    }

    /// Total route attempts with `outcome` on routes labelled `route`.
    #[must_use]
    pub fn attempt_count(&self, outcome: OutcomeCategory, route: &str) -> usize {
        self.attempts
            .iter()
            .filter(|entry| entry.key().outcome == outcome && entry.key().route == route)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Total route attempts on mirror routes.
    #[must_use]
    pub fn mirror_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|entry| entry.key().route.starts_with("mirror:"))
            .map(|entry| *entry.value())
            .sum()
    }

    /// Builds the run summary.
    #[must_use]
    pub fn summary(
        &self,
        tasks_total: usize,
        tasks_already_completed: usize,
        interrupted: bool,
        elapsed: Duration,
    ) -> RunSummary {
        let mut rows: Vec<(AttemptKey, usize)> = self
            .attempts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        rows.sort();

        let mut attempts_by_outcome = BTreeMap::new();
        let mut successes_by_type = BTreeMap::new();
        let mut successes_by_route = BTreeMap::new();
        for (key, count) in &rows {
            *attempts_by_outcome
                .entry(key.outcome.as_str().to_string())
                .or_insert(0) += count;
            if key.outcome == OutcomeCategory::Success {
                let bucket = key.effective_type.unwrap_or(EffectiveType::Unknown).bucket();
                *successes_by_type.entry(bucket.to_string()).or_insert(0) += count;
                *successes_by_route.entry(key.route.clone()).or_insert(0) += count;
            }
        }

        RunSummary {
            tasks_total,
            tasks_completed: self.completed(),
            tasks_failed: self.failed(),
            tasks_skipped: self.skipped(),
            tasks_already_completed,
            attempts_by_outcome,
            successes_by_type,
            successes_by_route,
            attempts: rows
                .into_iter()
                .map(|(key, count)| AttemptCount {
                    outcome: key.outcome,
                    effective_type: key.effective_type,
                    route: key.route,
                    count,
                })
                .collect(),
            retries: self.retries(),
            interrupted,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }
}

/// Type observed during an attempt, when one was sniffed.
fn observed_type(outcome: &AttemptOutcome) -> Option<EffectiveType> {
    match outcome {
        AttemptOutcome::Success { effective_type, .. } => Some(*effective_type),
        AttemptOutcome::RejectedContent(
            RejectReason::TooSmall { effective_type, .. } | RejectReason::NotPdf(effective_type),
        ) => Some(*effective_type),
        AttemptOutcome::RejectedContent(RejectReason::NoPages | RejectReason::Unparseable(_)) => {
            Some(EffectiveType::Pdf)
        }
        _ => None,
    }
}

/// One (outcome × type × route) cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptCount {
    pub outcome: OutcomeCategory,
    pub effective_type: Option<EffectiveType>,
    pub route: String,
    pub count: usize,
}

/// Structured report written at run end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_skipped: usize,
    /// Tasks skipped at start because the ledger already had them completed.
    pub tasks_already_completed: usize,
    pub attempts_by_outcome: BTreeMap<String, usize>,
    pub successes_by_type: BTreeMap<String, usize>,
    pub successes_by_route: BTreeMap<String, usize>,
    pub attempts: Vec<AttemptCount>,
    pub retries: usize,
    pub interrupted: bool,
    pub elapsed_secs: f64,
}

impl RunSummary {
    /// Writes the summary as pretty JSON to `<output_root>/run_summary.json`.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the file cannot be written.
    #[instrument(skip(self, output_root))]
    pub async fn write_to(&self, output_root: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        tokio::fs::write(output_root.join(SUMMARY_FILE), json).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::task::{FailureReason, SourceRoute};

    fn attempt(outcome: AttemptOutcome, route: SourceRoute, retries: u32) -> RouteAttempt {
        RouteAttempt {
            route,
            url: "http://example.org/paper".to_string(),
            outcome,
            retries,
        }
    }

    fn success(route: SourceRoute) -> AttemptOutcome {
        AttemptOutcome::Success {
            effective_type: EffectiveType::Pdf,
            body: Vec::new(),
            route,
        }
    }

    #[test]
    fn test_summary_groups_by_outcome_type_and_route() {
        let stats = RunStats::new();
        let mirror = SourceRoute::FallbackMirror("m.example".to_string());
        stats.record_attempt(&attempt(
            AttemptOutcome::PermanentFailure(FailureReason::new("http_404", "gone")),
            SourceRoute::Direct,
            0,
        ));
        stats.record_attempt(&attempt(success(mirror.clone()), mirror, 2));
        stats.record_terminal(LedgerStatus::Completed);

        let summary = stats.summary(1, 0, false, Duration::from_millis(1500));
        assert_eq!(summary.tasks_completed, 1);
        assert_eq!(summary.attempts_by_outcome.get("permanent_failure"), Some(&1));
        assert_eq!(summary.attempts_by_outcome.get("success"), Some(&1));
        assert_eq!(summary.successes_by_type.get("pdf"), Some(&1));
        assert_eq!(summary.successes_by_route.get("mirror:m.example"), Some(&1));
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.attempts.len(), 2);
        assert!((summary.elapsed_secs - 1.5).abs() < f64::EPSILON);
        assert_eq!(stats.mirror_attempts(), 1);
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = RunStats::new();
        for _ in 0..3 {
            stats.record_attempt(&attempt(success(SourceRoute::Direct), SourceRoute::Direct, 0));
        }
        stats.record_terminal(LedgerStatus::Failed);
        stats.record_terminal(LedgerStatus::Skipped);
        assert_eq!(stats.attempt_count(OutcomeCategory::Success, "direct"), 3);
        assert_eq!(stats.finished(), 2);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.skipped(), 1);
    }

    #[test]
    fn test_in_flight_guard_tracks_peak() {
        let stats = RunStats::new();
        {
            let _a = stats.enter_chain();
            let _b = stats.enter_chain();
            assert_eq!(stats.in_flight(), 2);
        }
        let _c = stats.enter_chain();
        assert_eq!(stats.in_flight(), 1);
        assert_eq!(stats.peak_in_flight(), 2);
    }

    #[test]
    fn test_summary_json_shape() {
        let stats = RunStats::new();
        stats.record_attempt(&attempt(success(SourceRoute::Direct), SourceRoute::Direct, 0));
        stats.record_terminal(LedgerStatus::Completed);
        let json = serde_json::to_value(stats.summary(1, 0, false, Duration::ZERO)).unwrap();
        assert_eq!(json["tasks_total"], 1);
        assert_eq!(json["successes_by_route"]["direct"], 1);
        assert_eq!(json["attempts"][0]["outcome"], "success");
        assert_eq!(json["attempts"][0]["effective_type"], "pdf");
        assert_eq!(json["attempts"][0]["route"], "direct");
        assert_eq!(json["interrupted"], false);
    }

    #[tokio::test]
    async fn test_write_summary_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let summary = RunStats::new().summary(0, 0, true, Duration::ZERO);
        summary.write_to(temp.path()).await.unwrap();
        let raw = std::fs::read_to_string(temp.path().join(SUMMARY_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["interrupted"], true);
    }
}
