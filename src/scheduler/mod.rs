//! Bounded-concurrency driver for fetch chains.
//!
//! The scheduler filters out tasks the ledger already has as completed, then
//! dispatches each remaining task exactly once. At most `max_concurrent`
//! chains hold a permit at any instant; the permit is an owned semaphore
//! permit moved into the spawned chain, so it is released on every exit path.
//! Each permit comes with a worker slot whose pacers space that worker's
//! Direct and mirror requests.
//!
//! On interruption no further tasks are dispatched. In-flight chains stop
//! after their current route attempt and still write their ledger row.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use harvester_core::fallback::MirrorResolver;
//! use harvester_core::fetch::{Fetcher, FetcherOptions, RetryPolicy};
//! use harvester_core::ledger::Ledger;
//! use harvester_core::scheduler::{Scheduler, SchedulerConfig};
//! use harvester_core::task::load_work_list;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let work_list = load_work_list(std::path::Path::new("work_list.txt"))?;
//! let ledger = Arc::new(Ledger::open(std::path::Path::new("out/harvest_state.db")).await?);
//! let fetcher = Fetcher::new(&FetcherOptions::default(), RetryPolicy::default())?;
//! let scheduler = Scheduler::prepare(
//!     SchedulerConfig::default(),
//!     fetcher,
//!     MirrorResolver::default(),
//!     ledger,
//!     std::path::Path::new("out"),
//! )
//! .await?;
//! let summary = scheduler.run(work_list.tasks, Arc::new(AtomicBool::new(false))).await?;
//! println!("completed: {}", summary.tasks_completed);
//! # Ok(())
//! # }
//! ```

mod chain;
mod persistence;
mod slot;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::attempt_log::AttemptLog;
use crate::fallback::MirrorResolver;
use crate::fetch::{Fetcher, RateLimiter};
use crate::ledger::{LedgerError, LedgerStore};
use crate::placement::{Placement, PlacementError};
use crate::stats::{RunStats, RunSummary};
use crate::task::Task;
use crate::verify::ContentPolicy;

use self::slot::SlotPool;

/// Minimum concurrent chains.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum concurrent chains.
pub const MAX_CONCURRENCY: usize = 100;

/// Default concurrent chains.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default spacing between one worker's Direct route starts.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Default spacing between one worker's mirror route starts.
pub const DEFAULT_MIRROR_DELAY: Duration = Duration::from_secs(5);

const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("max concurrent must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}, got {value}")]
    InvalidConcurrency { value: usize },

    /// The output root or its log directory cannot be written.
    #[error("output directory {path} is not writable: {source}")]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("concurrency semaphore closed")]
    SemaphoreClosed,
}

/// Which routes a run may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MirrorMode {
    /// Direct first, mirrors when Direct does not yield content.
    #[default]
    Fallback,
    /// Direct only.
    Disabled,
    /// Mirrors only.
    Only,
}

/// Run-level settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    /// Spacing between successive Direct route starts of one worker.
    pub delay: Duration,
    /// Spacing between successive mirror route starts of one worker.
    pub mirror_delay: Duration,
    pub mirror_mode: MirrorMode,
    /// HEAD pre-check of the declared type before a Direct download.
    pub check_content_type: bool,
    pub content_policy: ContentPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_CONCURRENCY,
            delay: DEFAULT_DELAY,
            mirror_delay: DEFAULT_MIRROR_DELAY,
            mirror_mode: MirrorMode::Fallback,
            check_content_type: false,
            content_policy: ContentPolicy::default(),
        }
    }
}

/// State shared by every chain of one run.
#[derive(Debug)]
pub(crate) struct RunContext {
    pub(crate) fetcher: Fetcher,
    /// Retry-After waits per host, shared by all workers and routes.
    pub(crate) host_limiter: RateLimiter,
    pub(crate) mirrors: MirrorResolver,
    pub(crate) mirror_mode: MirrorMode,
    pub(crate) check_content_type: bool,
    pub(crate) content_policy: ContentPolicy,
    pub(crate) placement: Placement,
    pub(crate) ledger: Arc<dyn LedgerStore>,
    pub(crate) log: AttemptLog,
    pub(crate) stats: Arc<RunStats>,
}

/// Drives a run.
#[derive(Debug)]
pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    slots: SlotPool,
    max_concurrent: usize,
    ctx: Arc<RunContext>,
}

impl Scheduler {
    /// Validates the configuration and prepares the output root.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConcurrency`] for an out-of-range bound
    /// and [`SchedulerError::OutputRoot`]/[`SchedulerError::Placement`] when
    /// the output root is not writable.
    #[instrument(level = "debug", skip_all, fields(output_root = %output_root.display()))]
    pub async fn prepare(
        config: SchedulerConfig,
        fetcher: Fetcher,
        mirrors: MirrorResolver,
        ledger: Arc<dyn LedgerStore>,
        output_root: &Path,
    ) -> Result<Self, SchedulerError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&config.max_concurrent) {
            return Err(SchedulerError::InvalidConcurrency {
                value: config.max_concurrent,
            });
        }

        let placement = Placement::new(output_root);
        placement.prepare().await?;
        let log = AttemptLog::open(output_root)
            .await
            .map_err(|source| SchedulerError::OutputRoot {
                path: output_root.to_path_buf(),
                source,
            })?;

        debug!(
            max_concurrent = config.max_concurrent,
            delay_ms = config.delay.as_millis(),
            mirror_delay_ms = config.mirror_delay.as_millis(),
            mirrors = mirrors.len(),
            mirror_mode = ?config.mirror_mode,
            "creating scheduler"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            slots: SlotPool::new(config.max_concurrent, config.delay, config.mirror_delay),
            max_concurrent: config.max_concurrent,
            ctx: Arc::new(RunContext {
                fetcher,
                host_limiter: RateLimiter::new(),
                mirrors,
                mirror_mode: config.mirror_mode,
                check_content_type: config.check_content_type,
                content_policy: config.content_policy,
                placement,
                ledger,
                log,
                stats: Arc::new(RunStats::new()),
            }),
        })
    }

    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Live counters for progress reporting.
    #[must_use]
    pub fn stats(&self) -> Arc<RunStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Runs every pending task once and writes the run summary.
    ///
    /// Individual task failures never fail the run.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Ledger`] if completed ids or legacy URLs
    /// cannot be loaded, or [`SchedulerError::SemaphoreClosed`].
    #[instrument(skip(self, tasks, interrupted), fields(tasks = tasks.len()))]
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        interrupted: Arc<AtomicBool>,
    ) -> Result<RunSummary, SchedulerError> {
        let started = Instant::now();
        let tasks_total = tasks.len();
        let completed_ids = self.ctx.ledger.completed_ids().await?;
        let completed_urls = self.ctx.ledger.completed_urls().await?;
        let (done, pending): (Vec<Task>, Vec<Task>) = tasks.into_iter().partition(|task| {
            completed_ids.contains(&task.id) || completed_urls.contains(&task.url)
        });
        let already_completed = done.len();

        info!(
            pending = pending.len(),
            already_completed, "starting run"
        );

        let mut handles: Vec<(Task, JoinHandle<()>)> = Vec::new();
        for task in pending {
            if interrupted.load(Ordering::SeqCst) {
                break;
            }
            drain_finished_chains(&mut handles, &self.ctx).await;

            // Race the permit against the interrupt flag so an interrupt
            // during a full-concurrency wait stops dispatch immediately.
            let permit = tokio::select! {
                biased;
                () = async {
                    while !interrupted.load(Ordering::SeqCst) {
                        tokio::time::sleep(INTERRUPT_POLL).await;
                    }
                } => None,
                result = Arc::clone(&self.semaphore).acquire_owned() => {
                    Some(result.map_err(|_| SchedulerError::SemaphoreClosed)?)
                }
            };
            let Some(permit) = permit else {
                break;
            };
            let lease = self.slots.lease(permit);

            debug!(task_id = %task.id, url = %task.url, "dispatching task");
            let ctx = Arc::clone(&self.ctx);
            let flag = Arc::clone(&interrupted);
            let chain_task = task.clone();
            handles.push((
                task,
                tokio::spawn(async move {
                    chain::process_task(&ctx, chain_task, &flag, lease.slot()).await;
                }),
            ));
        }

        debug!(in_flight = handles.len(), "waiting for in-flight chains");
        for (task, handle) in handles {
            if let Err(e) = handle.await {
                persistence::handle_task_join_error(&self.ctx, &task, &e).await;
            }
        }

        let was_interrupted = interrupted.load(Ordering::SeqCst);
        let summary = self.ctx.stats.summary(
            tasks_total,
            already_completed,
            was_interrupted,
            started.elapsed(),
        );
        if let Err(e) = summary.write_to(self.ctx.placement.output_root()).await {
            warn!(error = %e, "failed to write run summary");
        }

        info!(
            completed = summary.tasks_completed,
            failed = summary.tasks_failed,
            skipped = summary.tasks_skipped,
            already_completed,
            retries = summary.retries,
            interrupted = was_interrupted,
            elapsed_secs = summary.elapsed_secs,
            "run complete"
        );
        Ok(summary)
    }
}

async fn drain_finished_chains(handles: &mut Vec<(Task, JoinHandle<()>)>, ctx: &RunContext) {
    let mut idx = 0;
    while idx < handles.len() {
        if handles[idx].1.is_finished() {
            let (task, handle) = handles.swap_remove(idx);
            if let Err(e) = handle.await {
                persistence::handle_task_join_error(ctx, &task, &e).await;
            }
        } else {
            idx += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fetch::{FetcherOptions, RetryPolicy};
    use crate::ledger::Ledger;
    use tempfile::TempDir;

    async fn scheduler(max_concurrent: usize, root: &Path) -> Result<Scheduler, SchedulerError> {
        let ledger: Arc<dyn LedgerStore> = Arc::new(Ledger::in_memory().await.unwrap());
        Scheduler::prepare(
            SchedulerConfig {
                max_concurrent,
                ..SchedulerConfig::default()
            },
            Fetcher::new(&FetcherOptions::default(), RetryPolicy::default()).unwrap(),
            MirrorResolver::default(),
            ledger,
            root,
        )
        .await
    }

    #[tokio::test]
    async fn test_concurrency_bounds() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            scheduler(0, temp.path()).await,
            Err(SchedulerError::InvalidConcurrency { value: 0 })
        ));
        assert!(matches!(
            scheduler(101, temp.path()).await,
            Err(SchedulerError::InvalidConcurrency { value: 101 })
        ));
        assert_eq!(scheduler(100, temp.path()).await.unwrap().max_concurrent(), 100);
    }

    #[tokio::test]
    async fn test_prepare_creates_data_and_logs() {
        let temp = TempDir::new().unwrap();
        scheduler(1, temp.path()).await.unwrap();
        assert!(temp.path().join("data").is_dir());
        assert!(temp.path().join("logs/activity.jsonl").is_file());
    }

    #[tokio::test]
    async fn test_empty_run_writes_summary() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler(2, temp.path()).await.unwrap();
        let summary = scheduler
            .run(Vec::new(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(summary.tasks_total, 0);
        assert!(temp.path().join("run_summary.json").is_file());
    }

    #[tokio::test]
    async fn test_interrupt_before_dispatch_runs_nothing() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler(2, temp.path()).await.unwrap();
        let task = Task {
            id: "1".to_string(),
            url: "http://127.0.0.1:9/never".to_string(),
            doi: None,
            author: "Smith".to_string(),
            title: "Example".to_string(),
            year: None,
        };
        let summary = scheduler
            .run(vec![task], Arc::new(AtomicBool::new(true)))
            .await
            .unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.tasks_completed + summary.tasks_failed, 0);
        assert!(summary.attempts.is_empty());
    }
}
