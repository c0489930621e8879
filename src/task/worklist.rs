//! Work-list loading.
//!
//! Format, one record per line:
//!
//! ```text
//! publication_id | doi | first_author | shortened_title | url [| year]
//! ```
//!
//! A missing DOI is an empty field. Blank lines and `#` comments are ignored.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::Task;
use crate::fallback::normalize_doi;

/// Minimum number of pipe-delimited fields per record.
const REQUIRED_FIELDS: usize = 5;

/// Errors raised while loading the work list. All of them abort the run.
#[derive(Debug, Error)]
pub enum WorkListError {
    /// The work-list file could not be read.
    #[error("cannot read work list {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record is missing required fields.
    #[error("work list line {line}: expected at least {REQUIRED_FIELDS} '|' separated fields, found {found}")]
    MissingFields { line: usize, found: usize },

    /// A record has an empty publication id.
    #[error("work list line {line}: empty publication id")]
    EmptyId { line: usize },
}

/// Parsed work list.
#[derive(Debug, Default)]
pub struct WorkList {
    /// Tasks in file order, first occurrence of each id.
    pub tasks: Vec<Task>,
    /// Number of records dropped because their id was already seen.
    pub duplicates: usize,
}

impl WorkList {
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Reads and parses the work list at `path`.
///
/// # Errors
///
/// Returns [`WorkListError::Unreadable`] when the file cannot be read, or a
/// line-level error for the first malformed record.
#[instrument(fields(path = %path.display()))]
pub fn load_work_list(path: &Path) -> Result<WorkList, WorkListError> {
    let raw = std::fs::read_to_string(path).map_err(|source| WorkListError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    parse_work_list(&raw)
}

/// Parses work-list text.
///
/// # Errors
///
/// Returns a line-level [`WorkListError`] for the first malformed record.
pub fn parse_work_list(raw: &str) -> Result<WorkList, WorkListError> {
    let mut list = WorkList::default();
    let mut seen = HashSet::new();

    for (index, raw_line) in raw.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let task = parse_line(line, line_no)?;
        if !seen.insert(task.id.clone()) {
            warn!(task_id = %task.id, line = line_no, "duplicate publication id in work list, ignoring");
            list.duplicates += 1;
            continue;
        }
        list.tasks.push(task);
    }

    debug!(
        tasks = list.tasks.len(),
        duplicates = list.duplicates,
        "work list parsed"
    );
    Ok(list)
}

fn parse_line(line: &str, line_no: usize) -> Result<Task, WorkListError> {
    let fields: Vec<&str> = line.split('|').map(str::trim).collect();
    if fields.len() < REQUIRED_FIELDS {
        return Err(WorkListError::MissingFields {
            line: line_no,
            found: fields.len(),
        });
    }

    let id = fields[0];
    if id.is_empty() {
        return Err(WorkListError::EmptyId { line: line_no });
    }

    let year = fields
        .get(REQUIRED_FIELDS)
        .filter(|value| !value.is_empty())
        .map(|value| (*value).to_string());

    Ok(Task {
        id: id.to_string(),
        doi: normalize_doi(fields[1]),
        author: fields[2].to_string(),
        title: fields[3].to_string(),
        url: fields[4].to_string(),
        year,
    })
}
