//! Durable record of tasks that reached a terminal state.
//!
//! The ledger is the authority for resumption. Each task has at most one row;
//! a row is written once per run when the task is finalized, with a single
//! upsert statement, so a killed process leaves either the previous row or the
//! new one. A `completed` row is never overwritten.

mod error;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::db::Database;

pub use error::{LedgerDbErrorKind, LedgerError};

/// Result alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Completed,
    Failed,
    Skipped,
}

impl LedgerStatus {
    /// Database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(LedgerError::InvalidStatus(other.to_string())),
        }
    }
}

/// A persisted ledger row.
#[derive(Debug, Clone, FromRow)]
pub struct LedgerEntry {
    pub task_id: String,
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub route: Option<String>,
    pub file_path: Option<String>,
    pub reason: Option<String>,
    /// Route attempts accumulated over all runs.
    pub attempts: i64,
    pub updated_at: String,
}

impl LedgerEntry {
    /// Parsed status.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidStatus`] for an unrecognized value.
    pub fn status(&self) -> Result<LedgerStatus> {
        self.status_str.parse()
    }
}

/// A task's terminal record, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalization {
    pub task_id: String,
    pub status: LedgerStatus,
    pub route: Option<String>,
    pub file_path: Option<PathBuf>,
    pub reason: Option<String>,
    /// Route attempts made for the task in this run.
    pub attempts: u32,
}

/// Storage contract used by the scheduler.
#[async_trait]
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Ids of every task already `Completed`.
    async fn completed_ids(&self) -> Result<HashSet<String>>;

    /// URLs a legacy state file recorded as downloaded.
    async fn completed_urls(&self) -> Result<HashSet<String>>;

    /// Writes a task's terminal record. Returns `false` when the task was
    /// already completed and the row was left untouched.
    async fn finalize(&self, record: &Finalization) -> Result<bool>;

    /// Reads one task's row.
    async fn get(&self, task_id: &str) -> Result<Option<LedgerEntry>>;

    /// Reads every row, ordered by task id.
    async fn entries(&self) -> Result<Vec<LedgerEntry>>;
}

const SELECT_COLUMNS: &str =
    "SELECT task_id, status, route, file_path, reason, attempts, updated_at FROM ledger";

/// SQLite-backed ledger.
#[derive(Debug)]
pub struct Ledger {
    db: Database,
    /// All mutation goes through this lock, so the ledger has one writer.
    write_lock: Mutex<()>,
}

impl Ledger {
    /// Wraps an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// Opens the ledger at `state_path`, creating it when missing.
    ///
    /// A `.json` path is treated as a legacy state file: the ledger lives
    /// beside it as `<name>.db`, and the JSON array of downloaded URLs it
    /// contains is imported once; tasks with those URLs count as completed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the directory or database cannot be opened.
    #[instrument(skip(state_path), fields(path = %state_path.display()))]
    pub async fn open(state_path: &Path) -> Result<Self> {
        let is_legacy = state_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let db_path = if is_legacy {
            state_path.with_extension("db")
        } else {
            state_path.to_path_buf()
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| LedgerError::StateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let ledger = Self::new(Database::new(&db_path).await?);
        if is_legacy {
            ledger.import_legacy(state_path).await?;
        }
        Ok(ledger)
    }

    /// In-memory ledger for tests.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the database cannot be created.
    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::new_in_memory().await?))
    }

    /// Imports downloaded URLs from a legacy JSON state file. Missing, empty
    /// or corrupt files import nothing.
    async fn import_legacy(&self, json_path: &Path) -> Result<usize> {
        let raw = match tokio::fs::read_to_string(json_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                warn!(path = %json_path.display(), error = %e, "cannot read legacy state file, ignoring");
                return Ok(0);
            }
        };
        if raw.trim().is_empty() {
            return Ok(0);
        }
        let urls: Vec<String> = match serde_json::from_str(&raw) {
            Ok(urls) => urls,
            Err(e) => {
                warn!(path = %json_path.display(), error = %e, "legacy state file is not a JSON URL list, ignoring");
                return Ok(0);
            }
        };

        let _guard = self.write_lock.lock().await;
        let mut tx = self.db.pool().begin().await?;
        let mut imported = 0;
        for url in urls.iter().map(|url| url.trim()).filter(|url| !url.is_empty()) {
            let result = sqlx::query("INSERT OR IGNORE INTO legacy_urls (url) VALUES (?)")
                .bind(url)
                .execute(&mut *tx)
                .await?;
            imported += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        tx.commit().await?;
        if imported > 0 {
            info!(imported, path = %json_path.display(), "imported legacy state");
        }
        Ok(imported)
    }

    /// Closes the underlying database.
    pub async fn close(self) {
        self.db.close().await;
    }
}

#[async_trait]
impl LedgerStore for Ledger {
    #[instrument(skip(self))]
    async fn completed_ids(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT task_id FROM ledger WHERE status = ?")
            .bind(LedgerStatus::Completed.as_str())
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn completed_urls(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT url FROM legacy_urls")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    #[instrument(skip(self, record), fields(task_id = %record.task_id, status = %record.status))]
    async fn finalize(&self, record: &Finalization) -> Result<bool> {
        let file_path = record
            .file_path
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r"INSERT INTO ledger (task_id, status, route, file_path, reason, attempts, updated_at)
              VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
              ON CONFLICT(task_id) DO UPDATE SET
                  status = excluded.status,
                  route = excluded.route,
                  file_path = excluded.file_path,
                  reason = excluded.reason,
                  attempts = ledger.attempts + excluded.attempts,
                  updated_at = excluded.updated_at
              WHERE ledger.status <> 'completed'",
        )
        .bind(&record.task_id)
        .bind(record.status.as_str())
        .bind(record.route.as_deref())
        .bind(file_path)
        .bind(record.reason.as_deref())
        .bind(i64::from(record.attempts))
        .execute(self.db.pool())
        .await?;

        let written = result.rows_affected() > 0;
        if !written {
            debug!("task already completed, ledger row kept");
        }
        Ok(written)
    }

    async fn get(&self, task_id: &str) -> Result<Option<LedgerEntry>> {
        let entry = sqlx::query_as::<_, LedgerEntry>(&format!("{SELECT_COLUMNS} WHERE task_id = ?"))
            .bind(task_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(entry)
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let entries = sqlx::query_as::<_, LedgerEntry>(&format!("{SELECT_COLUMNS} ORDER BY task_id"))
            .fetch_all(self.db.pool())
            .await?;
        Ok(entries)
    }
}
