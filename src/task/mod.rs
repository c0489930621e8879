//! Task model: the unit of retrieval work and the outcomes it can produce.
//!
//! A [`Task`] is loaded once per run from the work list and never mutated.
//! Every route attempt for a task yields exactly one [`AttemptOutcome`].

mod worklist;

use std::fmt;

use serde::Serialize;

use crate::verify::{EffectiveType, RejectReason};

pub use worklist::{WorkList, WorkListError, load_work_list, parse_work_list};

/// One unit of retrieval work derived from a work-list record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Opaque publication identifier, unique within a work list.
    pub id: String,
    /// Primary (Direct route) URL.
    pub url: String,
    /// DOI when the record carries one. Normalized, never empty.
    pub doi: Option<String>,
    /// First author's surname.
    pub author: String,
    /// Shortened title slug.
    pub title: String,
    /// Declared source year.
    pub year: Option<String>,
}

/// A named path used to retrieve a task's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceRoute {
    /// The task's primary URL.
    Direct,
    /// An alternate retrieval service keyed by DOI, identified by its host.
    FallbackMirror(String),
}

impl SourceRoute {
    /// Stable label used in the ledger, logs and summary.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Direct => "direct".to_string(),
            Self::FallbackMirror(domain) => format!("mirror:{domain}"),
        }
    }

    #[must_use]
    pub fn is_mirror(&self) -> bool {
        matches!(self, Self::FallbackMirror(_))
    }
}

impl fmt::Display for SourceRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for SourceRoute {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// Network-level failure detail carried by failure outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReason {
    /// Short machine-readable code (`timeout`, `http_503`, ...).
    pub code: String,
    /// Human-readable message with URL context.
    pub message: String,
}

impl FailureReason {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Result of one (task, route) attempt. Produced once, never mutated.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// The route yielded usable content.
    Success {
        effective_type: EffectiveType,
        body: Vec<u8>,
        route: SourceRoute,
    },
    /// Bytes were fetched but judged unusable.
    RejectedContent(RejectReason),
    /// Network-level failure that survived the local micro-retry.
    TransientFailure(FailureReason),
    /// Failure that retrying the same route would not fix.
    PermanentFailure(FailureReason),
}

impl AttemptOutcome {
    #[must_use]
    pub fn category(&self) -> OutcomeCategory {
        match self {
            Self::Success { .. } => OutcomeCategory::Success,
            Self::RejectedContent(_) => OutcomeCategory::RejectedContent,
            Self::TransientFailure(_) => OutcomeCategory::TransientFailure,
            Self::PermanentFailure(_) => OutcomeCategory::PermanentFailure,
        }
    }

    /// Reason code for non-success outcomes.
    #[must_use]
    pub fn reason_code(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::RejectedContent(reason) => Some(reason.code().to_string()),
            Self::TransientFailure(reason) | Self::PermanentFailure(reason) => {
                Some(reason.code.clone())
            }
        }
    }

    /// Human-readable reason for non-success outcomes.
    #[must_use]
    pub fn reason_message(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::RejectedContent(reason) => Some(reason.to_string()),
            Self::TransientFailure(reason) | Self::PermanentFailure(reason) => {
                Some(reason.message.clone())
            }
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A finished route attempt.
#[derive(Debug, Clone)]
pub struct RouteAttempt {
    pub route: SourceRoute,
    /// Last URL requested on this route.
    pub url: String,
    pub outcome: AttemptOutcome,
    /// Micro-retries spent on this route.
    pub retries: u32,
}

/// Outcome category used for stats and log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCategory {
    Success,
    RejectedContent,
    TransientFailure,
    PermanentFailure,
}

impl OutcomeCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RejectedContent => "rejected_content",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl fmt::Display for OutcomeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
