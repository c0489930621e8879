//! Deterministic file naming from task metadata.
//!
//! Pattern: `<doi-or-id>_<author>_<title>.<ext>`, each segment sanitized and
//! bounded. Empty segments are dropped.

use std::path::{Path, PathBuf};

use crate::task::{SourceRoute, Task};
use crate::verify::{EffectiveType, word_extension};

/// Maximum characters kept from the DOI (or id) segment.
pub const MAX_ID_SEGMENT: usize = 80;

/// Maximum characters kept from the author segment.
pub const MAX_AUTHOR_SEGMENT: usize = 40;

/// Maximum characters kept from the title segment.
pub const MAX_TITLE_SEGMENT: usize = 60;

/// Directory under the output root that holds every bucket.
pub const DATA_DIR: &str = "data";

/// Bucket for mirror-route successes.
pub const MIRROR_BUCKET: &str = "sci_pdf";

/// Stem used when every metadata segment sanitizes to nothing.
const FALLBACK_STEM: &str = "task";

/// Sanitizes one name segment: path-unsafe characters and whitespace collapse
/// to a single `_`, leading and trailing separators and dots are dropped.
#[must_use]
pub fn sanitize_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            c if c.is_alphanumeric() || matches!(c, '-' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    out.trim_matches(|c| c == '_' || c == '.').to_string()
}

fn bounded_segment(value: &str, max_chars: usize) -> String {
    let sanitized = sanitize_segment(value);
    let truncated: String = sanitized.chars().take(max_chars).collect();
    truncated
        .trim_end_matches(|c| c == '_' || c == '.')
        .to_string()
}

/// File stem for a task, without extension.
#[must_use]
pub fn file_stem(task: &Task) -> String {
    let identity = task.doi.as_deref().unwrap_or(&task.id);
    let segments = [
        bounded_segment(identity, MAX_ID_SEGMENT),
        bounded_segment(&task.author, MAX_AUTHOR_SEGMENT),
        bounded_segment(&task.title, MAX_TITLE_SEGMENT),
    ];
    let stem = segments
        .iter()
        .filter(|segment| !segment.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("_");
    if stem.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        stem
    }
}

/// Extension for a verified body of `effective_type`.
#[must_use]
pub fn extension_for(effective_type: EffectiveType, body: &[u8]) -> &'static str {
    match effective_type {
        EffectiveType::Word => word_extension(body),
        other => other.extension(),
    }
}

/// Full file name for a task.
#[must_use]
pub fn file_name(task: &Task, effective_type: EffectiveType, body: &[u8]) -> String {
    format!("{}.{}", file_stem(task), extension_for(effective_type, body))
}

/// Directory receiving a success of `effective_type` through `route`.
#[must_use]
pub fn target_dir(output_root: &Path, effective_type: EffectiveType, route: &SourceRoute) -> PathBuf {
    let bucket = match route {
        SourceRoute::Direct => effective_type.bucket(),
        SourceRoute::FallbackMirror(_) => MIRROR_BUCKET,
    };
    output_root.join(DATA_DIR).join(bucket)
}

/// Path for the `n`-th candidate (`n >= 2` appends `_n` before the extension).
#[must_use]
pub fn numbered_name(file_name: &str, n: usize) -> String {
    if n <= 1 {
        return file_name.to_string();
    }
    match file_name.rfind('.') {
        Some(pos) => format!("{}_{n}{}", &file_name[..pos], &file_name[pos..]),
        None => format!("{file_name}_{n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(doi: Option<&str>, author: &str, title: &str) -> Task {
        Task {
            id: "42".to_string(),
            url: "http://example.org/paper".to_string(),
            doi: doi.map(str::to_string),
            author: author.to_string(),
            title: title.to_string(),
            year: None,
        }
    }

    #[test]
    fn test_sanitize_segment_replaces_unsafe_characters() {
        assert_eq!(sanitize_segment("10.1000/abc:def"), "10.1000_abc_def");
        assert_eq!(sanitize_segment("  a  b  "), "a_b");
        assert_eq!(sanitize_segment("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_segment("O'Brien"), "O_Brien");
        assert_eq!(sanitize_segment("Müller"), "Müller");
    }

    #[test]
    fn test_file_name_uses_doi_author_title() {
        let task = task(Some("10.1/x"), "Smith", "Example Study");
        assert_eq!(file_name(&task, EffectiveType::Pdf, b""), "10.1_x_Smith_Example_Study.pdf");
    }

    #[test]
    fn test_file_name_falls_back_to_id_without_doi() {
        let task = task(None, "Smith", "Example Study");
        assert_eq!(file_stem(&task), "42_Smith_Example_Study");
    }

    #[test]
    fn test_segments_are_bounded() {
        let long_title = "word ".repeat(40);
        let task = task(Some("10.1/x"), &"a".repeat(100), &long_title);
        let stem = file_stem(&task);
        assert!(stem.starts_with("10.1_x_"));
        assert!(stem.contains(&"a".repeat(MAX_AUTHOR_SEGMENT)));
        assert!(!stem.contains(&"a".repeat(MAX_AUTHOR_SEGMENT + 1)));
        let title_part = stem
            .strip_prefix(&format!("10.1_x_{}_", "a".repeat(MAX_AUTHOR_SEGMENT)))
            .unwrap_or_default();
        assert!(title_part.starts_with("word_word"));
        assert!(title_part.chars().count() <= MAX_TITLE_SEGMENT);
        assert!(!stem.ends_with('_'));
    }

    #[test]
    fn test_empty_segments_are_dropped() {
        let task = task(Some("10.1/x"), "", "///");
        assert_eq!(file_stem(&task), "10.1_x");
    }

    #[test]
    fn test_naming_is_deterministic() {
        let first = task(Some("10.5555/ABC.123"), "García", "A Study: Of Things?");
        let second = first.clone();
        let root = Path::new("/out");
        let a = target_dir(root, EffectiveType::Html, &SourceRoute::Direct)
            .join(file_name(&first, EffectiveType::Html, b""));
        let b = target_dir(root, EffectiveType::Html, &SourceRoute::Direct)
            .join(file_name(&second, EffectiveType::Html, b""));
        assert_eq!(a, b);
        assert_eq!(
            a,
            PathBuf::from("/out/data/html/10.5555_ABC.123_García_A_Study_Of_Things.html")
        );
    }

    #[test]
    fn test_mirror_route_goes_to_sci_pdf() {
        let dir = target_dir(
            Path::new("/out"),
            EffectiveType::Pdf,
            &SourceRoute::FallbackMirror("mirror.example".to_string()),
        );
        assert_eq!(dir, PathBuf::from("/out/data/sci_pdf"));
        assert_eq!(
            target_dir(Path::new("/out"), EffectiveType::Unknown, &SourceRoute::Direct),
            PathBuf::from("/out/data/unknown")
        );
    }

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("a.pdf", 1), "a.pdf");
        assert_eq!(numbered_name("a.pdf", 2), "a_2.pdf");
        assert_eq!(numbered_name("10.1_x.pdf", 3), "10.1_x_3.pdf");
        assert_eq!(numbered_name("noext", 2), "noext_2");
    }
}
