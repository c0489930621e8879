//! Boilerplate detection for HTML and XML bodies.

use std::sync::LazyLock;

use regex::Regex;

/// Pages with more visible text than this are treated as real documents even
/// when they mention a denial phrase somewhere.
const SHORT_PAGE_CHARS: usize = 2000;

/// Phrases that mark error, paywall and access-denied pages.
const DENIAL_PHRASES: &[&str] = &[
    "access denied",
    "access to this page has been denied",
    "403 forbidden",
    "404 not found",
    "error 403",
    "error 404",
    "page not found",
    "you do not have access",
    "you do not have permission",
    "you don't have permission",
    "not authorized to access",
    "subscription required",
    "purchase this article",
    "sign in to continue",
    "log in to continue",
    "service unavailable",
    "temporarily unavailable",
];

const CAPTCHA_PHRASES: &[&str] = &[
    "captcha",
    "are you a robot",
    "verify you are human",
    "unusual traffic",
];

#[allow(clippy::expect_used)]
static NON_VISIBLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>|<noscript\b[^>]*>.*?</noscript\s*>|<!--.*?-->",
    )
    .expect("non-visible markup regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex is valid"));

#[allow(clippy::expect_used)]
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

#[allow(clippy::expect_used)]
static META_REFRESH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]+http-equiv\s*=\s*["']?refresh"#)
        .expect("meta refresh regex is valid")
});

/// What a markup body looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkupSignal {
    /// A meta-refresh redirect with next to no text.
    MetaRefresh,
    /// A captcha challenge.
    Captcha,
    /// An error, paywall or access-denied page.
    AccessDenied,
    /// Anything else; carries the visible character count.
    Content { chars: usize },
}

/// Classifies a markup body. `min_text_chars` is the threshold below which a
/// meta-refresh page counts as a pure redirect.
#[must_use]
pub fn classify(raw: &str, min_text_chars: usize) -> MarkupSignal {
    let text = visible_text(raw);
    let chars = text.chars().count();

    if chars < min_text_chars && META_REFRESH.is_match(raw) {
        return MarkupSignal::MetaRefresh;
    }

    if chars < SHORT_PAGE_CHARS {
        let lowered_raw = raw.to_lowercase();
        if CAPTCHA_PHRASES
            .iter()
            .any(|phrase| lowered_raw.contains(phrase))
        {
            return MarkupSignal::Captcha;
        }

        let lowered = text.to_lowercase();
        if DENIAL_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
            return MarkupSignal::AccessDenied;
        }
    }

    MarkupSignal::Content { chars }
}

/// Returns a rough rendering of the human-visible text in a markup body.
#[must_use]
pub fn visible_text(raw: &str) -> String {
    let without_scripts = NON_VISIBLE.replace_all(raw, " ");
    let without_tags = TAG.replace_all(&without_scripts, " ");
    let decoded = without_tags.replace("&nbsp;", " ");
    WHITESPACE.replace_all(&decoded, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_text_strips_scripts_styles_and_tags() {
        let raw = "<html><head><style>p{color:red}</style><script>var a = '<b>';</script></head>\
                   <body><!-- hidden --><p>Hello&nbsp;<b>world</b></p></body></html>";
        assert_eq!(visible_text(raw), "Hello world");
    }

    #[test]
    fn test_meta_refresh_detected_on_empty_page() {
        let raw = r#"<meta HTTP-EQUIV="Refresh" content="0;url=/x">"#;
        assert_eq!(classify(raw, 200), MarkupSignal::MetaRefresh);
    }

    #[test]
    fn test_meta_refresh_ignored_on_long_page() {
        let raw = format!(
            r#"<html><head><meta http-equiv="refresh" content="600"></head><body>{}</body></html>"#,
            "Long article text. ".repeat(40)
        );
        assert!(matches!(classify(&raw, 200), MarkupSignal::Content { .. }));
    }

    #[test]
    fn test_captcha_detected_on_short_page() {
        let raw = r#"<html><body><div class="g-recaptcha"></div>Please prove you are human</body></html>"#;
        assert_eq!(classify(raw, 200), MarkupSignal::Captcha);
    }

    #[test]
    fn test_denial_phrase_on_long_page_is_content() {
        let raw = format!(
            "<html><body><p>{}</p><p>Access denied to participants was coded as missing.</p></body></html>",
            "Methods and results of the trial. ".repeat(80)
        );
        assert!(matches!(classify(&raw, 200), MarkupSignal::Content { .. }));
    }
}
