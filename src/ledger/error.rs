//! Error types for ledger operations.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::db::DbError;

/// Classification of state-database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerDbErrorKind {
    /// `SQLite` returned busy/locked.
    BusyOrLocked,
    /// A constraint (primary key, status check) rejected the write.
    ConstraintViolation,
    /// The pool was closed.
    PoolClosed,
    /// Filesystem or transport failure.
    Io,
    /// Anything else.
    Other,
}

impl LedgerDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                if matches!(
                    code.as_deref(),
                    Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
                ) || database_error
                    .message()
                    .to_ascii_lowercase()
                    .contains("database is locked")
                {
                    Self::BusyOrLocked
                } else if database_error.is_unique_violation()
                    || database_error.is_check_violation()
                {
                    Self::ConstraintViolation
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for LedgerDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolClosed => "pool_closed",
            Self::Io => "io",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Errors raised by the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A query failed.
    #[error("state database error ({kind}): {message}")]
    Database {
        kind: LedgerDbErrorKind,
        message: String,
    },

    /// The state database could not be opened.
    #[error(transparent)]
    Open(#[from] DbError),

    /// The directory holding the state file could not be created.
    #[error("cannot create state directory {path}: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored status value is not recognized.
    #[error("invalid ledger status '{0}'")]
    InvalidStatus(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: LedgerDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl LedgerError {
    /// Returns true for busy/locked database conditions.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: LedgerDbErrorKind::BusyOrLocked,
                ..
            }
        )
    }
}
