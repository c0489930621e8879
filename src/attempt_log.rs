//! Append-only JSON-lines attempt logs under `<output>/logs/`.
//!
//! - `activity.jsonl`: every route attempt and every task finalization
//! - `failed.jsonl`: tasks finalized `Failed`, with reason codes
//! - `mirror.jsonl`: mirror-route attempts only
//!
//! Each line is serialized up front and written with one `write_all` while the
//! file's mutex is held, so concurrent workers never interleave within a line.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::ledger::{Finalization, LedgerStatus};
use crate::task::{AttemptOutcome, OutcomeCategory, RouteAttempt};
use crate::verify::EffectiveType;

pub const LOG_DIR: &str = "logs";
pub const ACTIVITY_LOG: &str = "activity.jsonl";
pub const FAILED_LOG: &str = "failed.jsonl";
pub const MIRROR_LOG: &str = "mirror.jsonl";

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LogLine<'a> {
    Attempt {
        timestamp_ms: u128,
        task_id: &'a str,
        route: String,
        url: &'a str,
        outcome: OutcomeCategory,
        #[serde(skip_serializing_if = "Option::is_none")]
        effective_type: Option<EffectiveType>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason_code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        retries: u32,
    },
    Finalized {
        timestamp_ms: u128,
        task_id: &'a str,
        status: LedgerStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        route: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'a str>,
        attempts: u32,
    },
}

/// The three run logs.
#[derive(Debug)]
pub struct AttemptLog {
    activity: Mutex<File>,
    failed: Mutex<File>,
    mirror: Mutex<File>,
}

impl AttemptLog {
    /// Creates `<output_root>/logs/` and opens the logs for appending.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the directory or files cannot be opened.
    pub async fn open(output_root: &Path) -> std::io::Result<Self> {
        let dir = output_root.join(LOG_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            activity: Mutex::new(open_append(&dir.join(ACTIVITY_LOG)).await?),
            failed: Mutex::new(open_append(&dir.join(FAILED_LOG)).await?),
            mirror: Mutex::new(open_append(&dir.join(MIRROR_LOG)).await?),
        })
    }

    /// Logs one route attempt.
    ///
    /// # Errors
    ///
    /// Returns an IO error when a line cannot be appended.
    pub async fn record_attempt(&self, task_id: &str, attempt: &RouteAttempt) -> std::io::Result<()> {
        let effective_type = match &attempt.outcome {
            AttemptOutcome::Success { effective_type, .. } => Some(*effective_type),
            _ => None,
        };
        let line = encode(&LogLine::Attempt {
            timestamp_ms: now_ms(),
            task_id,
            route: attempt.route.label(),
            url: &attempt.url,
            outcome: attempt.outcome.category(),
            effective_type,
            reason_code: attempt.outcome.reason_code(),
            reason: attempt.outcome.reason_message(),
            retries: attempt.retries,
        })?;

        append(&self.activity, &line).await?;
        if attempt.route.is_mirror() {
            append(&self.mirror, &line).await?;
        }
        Ok(())
    }

    /// Logs a task finalization; `Failed` tasks also go to the failed log.
    ///
    /// # Errors
    ///
    /// Returns an IO error when a line cannot be appended.
    pub async fn record_finalization(&self, record: &Finalization) -> std::io::Result<()> {
        let line = encode(&LogLine::Finalized {
            timestamp_ms: now_ms(),
            task_id: &record.task_id,
            status: record.status,
            route: record.route.as_deref(),
            file_path: record
                .file_path
                .as_ref()
                .map(|path| path.display().to_string()),
            reason: record.reason.as_deref(),
            attempts: record.attempts,
        })?;

        append(&self.activity, &line).await?;
        if record.status == LedgerStatus::Failed {
            append(&self.failed, &line).await?;
        }
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

fn encode(line: &LogLine<'_>) -> std::io::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(line).map_err(std::io::Error::other)?;
    bytes.push(b'\n');
    Ok(bytes)
}

async fn append(file: &Mutex<File>, line: &[u8]) -> std::io::Result<()> {
    let mut file = file.lock().await;
    file.write_all(line).await?;
    file.flush().await
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
