//! One task's fetch chain: Direct route, then mirror routes in priority order,
//! stopping at the first success.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, instrument, warn};

use crate::fallback::is_non_document_url;
use crate::fetch::{FetchContext, failure_outcome, is_unusable_content_type};
use crate::task::{AttemptOutcome, RouteAttempt, SourceRoute, Task};
use crate::verify::{EffectiveType, RejectReason};

use super::slot::WorkerSlot;
use super::{MirrorMode, RunContext, persistence};

/// Reason stored when a task has no route to try.
pub(super) const NO_ROUTE_REASON: &str = "no_applicable_route";

/// How a chain ended, before placement and persistence.
#[derive(Debug)]
pub(super) enum ChainEnd {
    Success {
        effective_type: EffectiveType,
        body: Vec<u8>,
        route: SourceRoute,
        attempts: u32,
    },
    /// Every attempted route failed; `reason` is the last one observed.
    Exhausted { reason: String, attempts: u32 },
    /// No route was applicable, or the only outcome was a pre-check rejection.
    Skipped { reason: String, attempts: u32 },
    Interrupted { attempts: u32 },
}

/// Runs one task to its terminal state and persists it. The task counts as
/// in flight until its ledger row is written.
#[instrument(skip(ctx, task, interrupted, slot), fields(task_id = %task.id))]
pub(super) async fn process_task(
    ctx: &RunContext,
    task: Task,
    interrupted: &AtomicBool,
    slot: &WorkerSlot,
) {
    let _in_flight = ctx.stats.enter_chain();
    let end = run_chain(ctx, &task, interrupted, slot).await;
    persistence::finalize_task(ctx, &task, end).await;
}

async fn run_chain(
    ctx: &RunContext,
    task: &Task,
    interrupted: &AtomicBool,
    slot: &WorkerSlot,
) -> ChainEnd {
    let candidates = match (ctx.mirror_mode, task.doi.as_deref()) {
        (MirrorMode::Disabled, _) | (_, None) => Vec::new(),
        (_, Some(doi)) => ctx.mirrors.candidates(doi),
    };
    let try_direct = match ctx.mirror_mode {
        MirrorMode::Only => false,
        MirrorMode::Fallback | MirrorMode::Disabled => {
            !(is_non_document_url(&task.url) && !candidates.is_empty())
        }
    };
    if !try_direct && ctx.mirror_mode != MirrorMode::Only {
        debug!(url = %task.url, "direct URL is a landing page, starting at mirrors");
    }

    let mut tracker = ChainTracker::default();

    if try_direct {
        slot.direct.wait().await;
        if interrupted.load(Ordering::SeqCst) {
            return tracker.interrupted();
        }
        let step = direct_attempt(ctx, task).await;
        record(ctx, task, step.attempt()).await;
        match step {
            DirectStep::PreChecked(attempt) => tracker.pre_check_rejected(&attempt),
            DirectStep::Attempted(attempt) => {
                if let Some(end) = tracker.observe(attempt) {
                    return end;
                }
            }
        }
    }

    for candidate in &candidates {
        if interrupted.load(Ordering::SeqCst) {
            return tracker.interrupted();
        }
        slot.mirror.wait().await;
        if interrupted.load(Ordering::SeqCst) {
            return tracker.interrupted();
        }
        let attempt = ctx
            .mirrors
            .attempt(candidate, &ctx.fetcher, &ctx.host_limiter, &ctx.content_policy)
            .await;
        record(ctx, task, &attempt).await;
        if let Some(end) = tracker.observe(attempt) {
            return end;
        }
    }

    tracker.finish()
}

enum DirectStep {
    /// The HEAD pre-check rejected the declared type; no download was made.
    PreChecked(RouteAttempt),
    Attempted(RouteAttempt),
}

impl DirectStep {
    fn attempt(&self) -> &RouteAttempt {
        match self {
            Self::PreChecked(attempt) | Self::Attempted(attempt) => attempt,
        }
    }
}

async fn direct_attempt(ctx: &RunContext, task: &Task) -> DirectStep {
    if ctx.check_content_type
        && let Some(content_type) = ctx
            .fetcher
            .head_content_type(&task.url, &ctx.host_limiter)
            .await
        && is_unusable_content_type(&content_type)
    {
        debug!(url = %task.url, content_type = %content_type, "declared type unusable, skipping download");
        return DirectStep::PreChecked(RouteAttempt {
            route: SourceRoute::Direct,
            url: task.url.clone(),
            outcome: AttemptOutcome::RejectedContent(RejectReason::UnusableDeclaredType(
                content_type,
            )),
            retries: 0,
        });
    }

    let report = ctx
        .fetcher
        .fetch(&task.url, FetchContext::new(&ctx.host_limiter))
        .await;
    let retries = report.retries();
    let outcome = match report.result {
        Ok(fetched) => {
            let (body, verdict) = ctx
                .content_policy
                .judge_owned(fetched.body, fetched.content_type)
                .await;
            match verdict {
                Ok(effective_type) => AttemptOutcome::Success {
                    effective_type,
                    body,
                    route: SourceRoute::Direct,
                },
                Err(reason) => AttemptOutcome::RejectedContent(reason),
            }
        }
        Err(error) => failure_outcome(&error),
    };

    DirectStep::Attempted(RouteAttempt {
        route: SourceRoute::Direct,
        url: task.url.clone(),
        outcome,
        retries,
    })
}

async fn record(ctx: &RunContext, task: &Task, attempt: &RouteAttempt) {
    ctx.stats.record_attempt(attempt);
    if let Err(error) = ctx.log.record_attempt(&task.id, attempt).await {
        warn!(task_id = %task.id, error = %error, "failed to append attempt log");
    }
    if !attempt.outcome.is_success() {
        debug!(
            task_id = %task.id,
            route = %attempt.route,
            reason = attempt.outcome.reason_message().as_deref().unwrap_or(""),
            "route did not yield content"
        );
    }
}

/// Attempt bookkeeping for one chain.
#[derive(Debug, Default)]
struct ChainTracker {
    attempts: u32,
    last_reason: Option<String>,
    pre_check_reason: Option<String>,
}

impl ChainTracker {
    /// Counts a real route attempt. Returns the chain end on success.
    fn observe(&mut self, attempt: RouteAttempt) -> Option<ChainEnd> {
        self.attempts += 1;
        match attempt.outcome {
            AttemptOutcome::Success {
                effective_type,
                body,
                route,
            } => Some(ChainEnd::Success {
                effective_type,
                body,
                route,
                attempts: self.attempts,
            }),
            outcome => {
                self.last_reason = Some(describe(&outcome));
                None
            }
        }
    }

    /// A pre-check rejection is logged but not counted as an attempt.
    fn pre_check_rejected(&mut self, attempt: &RouteAttempt) {
        self.pre_check_reason = Some(describe(&attempt.outcome));
    }

    fn interrupted(&self) -> ChainEnd {
        ChainEnd::Interrupted {
            attempts: self.attempts,
        }
    }

    fn finish(self) -> ChainEnd {
        match self.last_reason {
            Some(reason) if self.attempts > 0 => ChainEnd::Exhausted {
                reason,
                attempts: self.attempts,
            },
            _ => ChainEnd::Skipped {
                reason: self
                    .pre_check_reason
                    .unwrap_or_else(|| NO_ROUTE_REASON.to_string()),
                attempts: self.attempts,
            },
        }
    }
}

fn describe(outcome: &AttemptOutcome) -> String {
    match (outcome.reason_code(), outcome.reason_message()) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code,
        _ => "unknown".to_string(),
    }
}
