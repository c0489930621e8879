//! Content verification: effective-type sniffing and minimum-viability checks.
//!
//! The declared `Content-Type` is advisory only. Magic bytes and document
//! structure decide the [`EffectiveType`]; each type then has its own
//! viability check. A failed check yields a [`RejectReason`].
//!
//! # Example
//!
//! ```
//! use harvester_core::verify::{EffectiveType, VerifyThresholds, verify_content};
//!
//! let page = br#"<html><head><meta http-equiv="refresh" content="0; url=/login"></head></html>"#;
//! let verdict = verify_content(page, Some("text/html"), &VerifyThresholds::default());
//! assert!(verdict.is_err());
//!
//! let text = b"Plain text body that is long enough to be kept as a document, honest.";
//! assert_eq!(
//!     verify_content(text, None, &VerifyThresholds::default()).ok(),
//!     Some(EffectiveType::Text)
//! );
//! ```

mod markup;
mod sniff;

use std::fmt;

use serde::Serialize;
use tracing::{debug, instrument};

pub use markup::{MarkupSignal, visible_text};
pub use sniff::{sniff_type, word_extension};

/// Default minimum size of an accepted PDF.
pub const DEFAULT_MIN_PDF_BYTES: usize = 1024;

/// Default minimum size of an accepted HTML or XML document.
pub const DEFAULT_MIN_MARKUP_BYTES: usize = 512;

/// Default minimum size of an accepted Word or plain-text document.
pub const DEFAULT_MIN_TEXT_BYTES: usize = 64;

/// Default minimum number of visible text characters in a markup document.
pub const DEFAULT_MIN_MARKUP_TEXT_CHARS: usize = 200;

/// Content classification determined by structural sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveType {
    Pdf,
    Html,
    Xml,
    Word,
    Text,
    Unknown,
}

impl EffectiveType {
    /// Output directory bucket under `data/`.
    #[must_use]
    pub fn bucket(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Html => "html",
            Self::Xml => "xml",
            Self::Word => "word",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }

    /// Default file extension, without the dot. Word documents are refined by
    /// [`word_extension`].
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Html => "html",
            Self::Xml => "xml",
            Self::Word => "doc",
            Self::Text => "txt",
            Self::Unknown => "bin",
        }
    }
}

impl fmt::Display for EffectiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.bucket())
    }
}

/// Why a fetched body was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The response had no body.
    EmptyBody,
    /// The body is below the threshold for its type.
    TooSmall {
        effective_type: EffectiveType,
        len: usize,
        min: usize,
    },
    /// The body claims to be a PDF but does not parse.
    Unparseable(String),
    /// The PDF parsed but has no pages.
    NoPages,
    /// An access-denied, paywall or error page.
    AccessDenied,
    /// A page whose only purpose is a meta-refresh redirect.
    MetaRefresh,
    /// A captcha challenge page.
    Captcha,
    /// A markup page with next to no readable text.
    NoText { chars: usize, min: usize },
    /// A Word or text body consisting only of whitespace.
    Whitespace,
    /// The declared type is known-unusable and the download was not attempted.
    UnusableDeclaredType(String),
    /// The route only accepts PDF content and got something else.
    NotPdf(EffectiveType),
    /// A mirror answered with a page that has no document link.
    NoDocumentLink,
}

impl RejectReason {
    /// Short machine-readable code for logs and the ledger.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyBody => "empty_body",
            Self::TooSmall { .. } => "too_small",
            Self::Unparseable(_) => "unparseable_pdf",
            Self::NoPages => "no_pages",
            Self::AccessDenied => "access_denied",
            Self::MetaRefresh => "meta_refresh",
            Self::Captcha => "captcha",
            Self::NoText { .. } => "no_text",
            Self::Whitespace => "whitespace_only",
            Self::UnusableDeclaredType(_) => "unusable_content_type",
            Self::NotPdf(_) => "not_pdf",
            Self::NoDocumentLink => "no_document_link",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBody => f.write_str("empty response body"),
            Self::TooSmall {
                effective_type,
                len,
                min,
            } => write!(f, "{effective_type} body too small: {len} bytes (minimum {min})"),
            Self::Unparseable(detail) => write!(f, "PDF does not parse: {detail}"),
            Self::NoPages => f.write_str("PDF has no pages"),
            Self::AccessDenied => f.write_str("access denied or error page"),
            Self::MetaRefresh => f.write_str("meta-refresh redirect page"),
            Self::Captcha => f.write_str("captcha challenge page"),
            Self::NoText { chars, min } => {
                write!(f, "markup has {chars} visible characters (minimum {min})")
            }
            Self::Whitespace => f.write_str("body is whitespace only"),
            Self::UnusableDeclaredType(content_type) => {
                write!(f, "declared content type {content_type} is not a document")
            }
            Self::NotPdf(found) => write!(f, "expected PDF, got {found}"),
            Self::NoDocumentLink => f.write_str("no document link found on mirror page"),
        }
    }
}

/// Tunable thresholds for the viability checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyThresholds {
    pub min_pdf_bytes: usize,
    pub min_markup_bytes: usize,
    pub min_text_bytes: usize,
    pub min_markup_text_chars: usize,
}

impl Default for VerifyThresholds {
    fn default() -> Self {
        Self {
            min_pdf_bytes: DEFAULT_MIN_PDF_BYTES,
            min_markup_bytes: DEFAULT_MIN_MARKUP_BYTES,
            min_text_bytes: DEFAULT_MIN_TEXT_BYTES,
            min_markup_text_chars: DEFAULT_MIN_MARKUP_TEXT_CHARS,
        }
    }
}

/// Run-level verification settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPolicy {
    /// When false, any non-empty body is accepted under its sniffed type.
    pub enabled: bool,
    pub thresholds: VerifyThresholds,
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: VerifyThresholds::default(),
        }
    }
}

impl ContentPolicy {
    /// Judges a body under this policy.
    ///
    /// # Errors
    ///
    /// Returns the [`RejectReason`] when the body is not usable.
    pub fn judge(&self, body: &[u8], declared: Option<&str>) -> Result<EffectiveType, RejectReason> {
        if self.enabled {
            verify_content(body, declared, &self.thresholds)
        } else if body.is_empty() {
            Err(RejectReason::EmptyBody)
        } else {
            Ok(sniff_type(body, declared))
        }
    }

    /// [`judge`](Self::judge) on the blocking pool, handing the body back
    /// with the verdict. PDF parsing of a large body must not stall the
    /// runtime.
    pub async fn judge_owned(
        &self,
        body: Vec<u8>,
        declared: Option<String>,
    ) -> (Vec<u8>, Result<EffectiveType, RejectReason>) {
        let policy = self.clone();
        let job = tokio::task::spawn_blocking(move || {
            let verdict = policy.judge(&body, declared.as_deref());
            (body, verdict)
        });
        match job.await {
            Ok(judged) => judged,
            Err(error) => (
                Vec::new(),
                Err(RejectReason::Unparseable(format!("verification aborted: {error}"))),
            ),
        }
    }
}

/// Classifies `body` and applies the viability check for its effective type.
///
/// # Errors
///
/// Returns the [`RejectReason`] of the first failed check.
#[instrument(skip(body, thresholds), fields(len = body.len()))]
pub fn verify_content(
    body: &[u8],
    declared: Option<&str>,
    thresholds: &VerifyThresholds,
) -> Result<EffectiveType, RejectReason> {
    if body.is_empty() {
        return Err(RejectReason::EmptyBody);
    }

    let effective_type = sniff_type(body, declared);
    debug!(%effective_type, declared = declared.unwrap_or(""), "sniffed content");

    match effective_type {
        EffectiveType::Pdf => check_pdf(body, thresholds)?,
        EffectiveType::Html | EffectiveType::Xml => {
            check_markup(body, effective_type, thresholds)?;
        }
        EffectiveType::Word | EffectiveType::Text => {
            check_text_like(body, effective_type, thresholds)?;
        }
        EffectiveType::Unknown => {}
    }

    Ok(effective_type)
}

fn check_pdf(body: &[u8], thresholds: &VerifyThresholds) -> Result<(), RejectReason> {
    if body.len() < thresholds.min_pdf_bytes {
        return Err(RejectReason::TooSmall {
            effective_type: EffectiveType::Pdf,
            len: body.len(),
            min: thresholds.min_pdf_bytes,
        });
    }

    let document = lopdf::Document::load_mem(body)
        .map_err(|error| RejectReason::Unparseable(error.to_string()))?;
    if document.get_pages().is_empty() {
        return Err(RejectReason::NoPages);
    }
    Ok(())
}

fn check_markup(
    body: &[u8],
    effective_type: EffectiveType,
    thresholds: &VerifyThresholds,
) -> Result<(), RejectReason> {
    let text = String::from_utf8_lossy(body);

    // Boilerplate is checked before size so the reason names the page kind.
    match markup::classify(&text, thresholds.min_markup_text_chars) {
        MarkupSignal::MetaRefresh => return Err(RejectReason::MetaRefresh),
        MarkupSignal::Captcha => return Err(RejectReason::Captcha),
        MarkupSignal::AccessDenied => return Err(RejectReason::AccessDenied),
        MarkupSignal::Content { .. } => {}
    }

    if body.len() < thresholds.min_markup_bytes {
        return Err(RejectReason::TooSmall {
            effective_type,
            len: body.len(),
            min: thresholds.min_markup_bytes,
        });
    }

    let chars = visible_text(&text).chars().count();
    if chars < thresholds.min_markup_text_chars {
        return Err(RejectReason::NoText {
            chars,
            min: thresholds.min_markup_text_chars,
        });
    }
    Ok(())
}

fn check_text_like(
    body: &[u8],
    effective_type: EffectiveType,
    thresholds: &VerifyThresholds,
) -> Result<(), RejectReason> {
    if body.len() < thresholds.min_text_bytes {
        return Err(RejectReason::TooSmall {
            effective_type,
            len: body.len(),
            min: thresholds.min_text_bytes,
        });
    }
    if effective_type == EffectiveType::Text && body.iter().all(u8::is_ascii_whitespace) {
        return Err(RejectReason::Whitespace);
    }
    Ok(())
}
