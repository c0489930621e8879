//! Exit code logic for the harvester process.
//!
//! Single responsibility: map a run summary to the process exit outcome.

use std::process::ExitCode;

use crate::stats::RunSummary;

/// Process exit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// No task failed.
    Success,
    /// Some tasks completed and some failed.
    Partial,
    /// Nothing completed while something failed, the run was interrupted,
    /// or configuration was invalid.
    Failure,
}

impl ProcessExit {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Partial => 2,
        }
    }
}

impl From<ProcessExit> for ExitCode {
    fn from(outcome: ProcessExit) -> Self {
        ExitCode::from(outcome.code())
    }
}

/// Determines the process exit outcome from a finished run.
#[must_use]
pub fn determine_exit_outcome(summary: &RunSummary) -> ProcessExit {
    if summary.interrupted {
        ProcessExit::Failure
    } else if summary.tasks_failed == 0 {
        ProcessExit::Success
    } else if summary.tasks_completed > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}
