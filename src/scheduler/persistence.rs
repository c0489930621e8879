use std::path::PathBuf;

use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::ledger::{Finalization, LedgerError, LedgerStatus};
use crate::placement::Placed;
use crate::task::Task;

use super::RunContext;
use super::chain::ChainEnd;

/// Reason code stored for chains stopped by an interrupt.
pub(super) const INTERRUPTED_REASON: &str = "interrupted";

/// Reason code reported when a task's ledger row cannot be written.
const LEDGER_WRITE_REASON: &str = "ledger_write";

/// Places content for a successful chain and writes the task's single ledger
/// row. The ledger write happens before the task is counted or logged as done.
pub(super) async fn finalize_task(ctx: &RunContext, task: &Task, end: ChainEnd) {
    let record = match end {
        ChainEnd::Success {
            effective_type,
            body,
            route,
            attempts,
        } => match ctx
            .placement
            .place(task, effective_type, &route, &body)
            .await
        {
            Ok(placed) => {
                if let Placed::AlreadyPresent(path) = &placed {
                    debug!(task_id = %task.id, path = %path.display(), "reusing identical file");
                }
                Finalization {
                    task_id: task.id.clone(),
                    status: LedgerStatus::Completed,
                    route: Some(route.label()),
                    file_path: Some(relative_to_root(ctx, placed.path())),
                    reason: None,
                    attempts,
                }
            }
            Err(error) => {
                warn!(task_id = %task.id, error = %error, "failed to place content");
                Finalization {
                    task_id: task.id.clone(),
                    status: LedgerStatus::Failed,
                    route: Some(route.label()),
                    file_path: None,
                    reason: Some(format!("placement_error: {error}")),
                    attempts,
                }
            }
        },
        ChainEnd::Exhausted { reason, attempts } => Finalization {
            task_id: task.id.clone(),
            status: LedgerStatus::Failed,
            route: None,
            file_path: None,
            reason: Some(reason),
            attempts,
        },
        ChainEnd::Skipped { reason, attempts } => Finalization {
            task_id: task.id.clone(),
            status: LedgerStatus::Skipped,
            route: None,
            file_path: None,
            reason: Some(reason),
            attempts,
        },
        ChainEnd::Interrupted { attempts } => Finalization {
            task_id: task.id.clone(),
            status: LedgerStatus::Failed,
            route: None,
            file_path: None,
            reason: Some(INTERRUPTED_REASON.to_string()),
            attempts,
        },
    };

    persist(ctx, record).await;
}

/// Records a chain that panicked as `Failed` so the next run retries it.
pub(super) async fn handle_task_join_error(ctx: &RunContext, task: &Task, error: &JoinError) {
    warn!(task_id = %task.id, error = %error, "fetch chain panicked");
    let record = Finalization {
        task_id: task.id.clone(),
        status: LedgerStatus::Failed,
        route: None,
        file_path: None,
        reason: Some(format!("task_panic: {error}")),
        attempts: 0,
    };
    persist(ctx, record).await;
}

/// Writes the row, then counts and logs the task. A task whose row cannot be
/// written is reported `Failed`, whatever its chain achieved.
async fn persist(ctx: &RunContext, record: Finalization) {
    let record = match write_row(ctx, &record).await {
        Ok(()) => record,
        Err(error) => {
            warn!(
                task_id = %record.task_id,
                error = %error,
                "failed to write ledger entry"
            );
            Finalization {
                status: LedgerStatus::Failed,
                file_path: None,
                reason: Some(format!("{LEDGER_WRITE_REASON}: {error}")),
                ..record
            }
        }
    };

    ctx.stats.record_terminal(record.status);
    if let Err(error) = ctx.log.record_finalization(&record).await {
        warn!(task_id = %record.task_id, error = %error, "failed to append finalization log");
    }

    match record.status {
        LedgerStatus::Completed => info!(
            task_id = %record.task_id,
            route = record.route.as_deref().unwrap_or(""),
            "task completed"
        ),
        LedgerStatus::Failed => warn!(
            task_id = %record.task_id,
            reason = record.reason.as_deref().unwrap_or(""),
            attempts = record.attempts,
            "task failed"
        ),
        LedgerStatus::Skipped => info!(
            task_id = %record.task_id,
            reason = record.reason.as_deref().unwrap_or(""),
            "task skipped"
        ),
    }
}

/// One retry on a failed write.
async fn write_row(ctx: &RunContext, record: &Finalization) -> Result<(), LedgerError> {
    let written = match ctx.ledger.finalize(record).await {
        Ok(written) => written,
        Err(error) => {
            debug!(task_id = %record.task_id, error = %error, "ledger write failed, retrying");
            ctx.ledger.finalize(record).await?
        }
    };
    if !written {
        debug!(task_id = %record.task_id, "ledger already completed, row kept");
    }
    Ok(())
}

fn relative_to_root(ctx: &RunContext, path: &std::path::Path) -> PathBuf {
    path.strip_prefix(ctx.placement.output_root())
        .unwrap_or(path)
        .to_path_buf()
}
