//! Document link extraction from mirror landing pages.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

static IFRAME_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?is)<iframe\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#)
});
static EMBED_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?is)<embed\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#)
});
/// Opening tag carrying `id="buttons"`; anchors are searched after it.
static BUTTONS_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?is)<(\w+)\b[^>]*\bid\s*=\s*["']buttons["'][^>]*>"#)
});
static ANCHOR_HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']+)["']"#)
});
static SCRIPT_BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<script\b[^>]*>(.*?)</script>"));
static ABSOLUTE_PDF_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"https?://[^\s'"]+\.pdf"#));

/// Returns true when a mirror page is a captcha challenge.
#[must_use]
pub fn is_captcha_page(html: &str) -> bool {
    html.to_ascii_lowercase().contains("captcha")
}

/// Finds the embedded document link in a mirror page.
///
/// Candidates are tried in order: iframe source, embed source, the first
/// anchor inside the `#buttons` block, any anchor mentioning `.pdf`, and
/// finally an absolute `.pdf` URL inside script text.
#[must_use]
pub fn extract_document_link(html: &str, base_url: &Url) -> Option<String> {
    first_capture(&IFRAME_SRC_RE, html)
        .or_else(|| first_capture(&EMBED_SRC_RE, html))
        .or_else(|| buttons_anchor(html))
        .or_else(|| {
            ANCHOR_HREF_RE
                .captures_iter(html)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim()))
                .find(|href| href.to_ascii_lowercase().contains(".pdf"))
                .map(str::to_string)
        })
        .or_else(|| {
            SCRIPT_BODY_RE
                .captures_iter(html)
                .filter_map(|caps| caps.get(1))
                .find_map(|script| ABSOLUTE_PDF_RE.find(script.as_str()))
                .map(|m| m.as_str().to_string())
        })
        .and_then(|link| absolutize_url(&link, base_url))
}

/// Resolves a page link against the page URL. Protocol-relative links get
/// `https:`.
#[must_use]
pub fn absolutize_url(value: &str, base_url: &Url) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('#') || value.starts_with("javascript:") {
        return None;
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    if value.starts_with("//") {
        return Some(format!("https:{value}"));
    }
    base_url.join(value).ok().map(|url| url.to_string())
}

fn first_capture(regex: &Regex, html: &str) -> Option<String> {
    regex
        .captures(html)
        .and_then(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|value| !value.is_empty())
}

fn buttons_anchor(html: &str) -> Option<String> {
    let caps = BUTTONS_BLOCK_RE.captures(html)?;
    let open = caps.get(0)?;
    let tag = caps.get(1)?.as_str().to_ascii_lowercase();
    let rest = &html[open.end()..];
    let closing = format!("</{tag}");
    let block_end = rest.to_ascii_lowercase().find(&closing).unwrap_or(rest.len());
    first_capture(&ANCHOR_HREF_RE, &rest[..block_end])
}
