//! Magic-byte and structural type sniffing.

use super::EffectiveType;

const PDF_MAGIC: &[u8] = b"%PDF-";
const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Servers sometimes prepend junk before the PDF header; readers accept it
/// within the first kilobyte.
const PDF_HEADER_WINDOW: usize = 1024;

/// Bytes inspected for text classification.
const TEXT_WINDOW: usize = 4096;

/// Determines the effective type of `body`.
///
/// Structure wins over the declared header. The header only breaks ties
/// between markup flavours when the bytes themselves are ambiguous.
#[must_use]
pub fn sniff_type(body: &[u8], declared: Option<&str>) -> EffectiveType {
    let head = &body[..body.len().min(PDF_HEADER_WINDOW)];
    if contains(head, PDF_MAGIC) {
        return EffectiveType::Pdf;
    }
    if body.starts_with(&OLE_MAGIC) {
        return EffectiveType::Word;
    }
    if body.starts_with(ZIP_MAGIC) {
        return if contains(body, b"word/") {
            EffectiveType::Word
        } else {
            EffectiveType::Unknown
        };
    }

    let Some(text) = text_prefix(body) else {
        return EffectiveType::Unknown;
    };
    if !is_printable(text) {
        return EffectiveType::Unknown;
    }

    let lowered = text
        .trim_start_matches('\u{feff}')
        .trim_start()
        .to_ascii_lowercase();

    if lowered.starts_with("<?xml") {
        return if lowered.contains("<html") {
            EffectiveType::Html
        } else {
            EffectiveType::Xml
        };
    }
    if ["<!doctype html", "<html", "<head", "<body"]
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return EffectiveType::Html;
    }
    if lowered.starts_with('<') {
        let declared_html = declared.is_some_and(|value| value.to_ascii_lowercase().contains("html"));
        return if declared_html || lowered.contains("<html") {
            EffectiveType::Html
        } else {
            EffectiveType::Xml
        };
    }
    if lowered.contains("<html") {
        return EffectiveType::Html;
    }

    EffectiveType::Text
}

/// File extension for a Word document: OOXML packages are `docx`.
#[must_use]
pub fn word_extension(body: &[u8]) -> &'static str {
    if body.starts_with(ZIP_MAGIC) {
        "docx"
    } else {
        "doc"
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Returns the UTF-8 prefix of `body`, tolerating a character cut at the
/// window edge. `None` when the bytes are not UTF-8.
fn text_prefix(body: &[u8]) -> Option<&str> {
    let window = &body[..body.len().min(TEXT_WINDOW)];
    match std::str::from_utf8(window) {
        Ok(text) => Some(text),
        Err(error) if error.error_len().is_none() => {
            std::str::from_utf8(&window[..error.valid_up_to()]).ok()
        }
        Err(_) => None,
    }
}

fn is_printable(text: &str) -> bool {
    let mut total = 0usize;
    let mut control = 0usize;
    for ch in text.chars() {
        total += 1;
        if ch == '\0' {
            return false;
        }
        if ch.is_control() && !matches!(ch, '\n' | '\r' | '\t' | '\u{c}') {
            control += 1;
        }
    }
    control * 100 <= total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdf_magic_wins_over_declared_html() {
        assert_eq!(
            sniff_type(b"%PDF-1.7\n...", Some("text/html")),
            EffectiveType::Pdf
        );
    }

    #[test]
    fn test_pdf_header_after_leading_junk() {
        let mut body = vec![b'\n'; 16];
        body.extend_from_slice(b"%PDF-1.4\n");
        assert_eq!(sniff_type(&body, None), EffectiveType::Pdf);
    }

    #[test]
    fn test_declared_pdf_is_not_trusted_alone() {
        assert_eq!(
            sniff_type(b"<html><body>Moved</body></html>", Some("application/pdf")),
            EffectiveType::Html
        );
    }

    #[test]
    fn test_ole_and_ooxml_are_word() {
        let ole = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, 0x00];
        assert_eq!(sniff_type(&ole, None), EffectiveType::Word);
        assert_eq!(word_extension(&ole), "doc");

        let mut docx = b"PK\x03\x04".to_vec();
        docx.extend_from_slice(b"....[Content_Types].xml....word/document.xml");
        assert_eq!(sniff_type(&docx, None), EffectiveType::Word);
        assert_eq!(word_extension(&docx), "docx");
    }

    #[test]
    fn test_plain_zip_is_unknown() {
        let zip = b"PK\x03\x04....data/file.csv";
        assert_eq!(sniff_type(zip, Some("application/zip")), EffectiveType::Unknown);
    }

    #[test]
    fn test_xml_and_xhtml() {
        assert_eq!(
            sniff_type(b"<?xml version=\"1.0\"?><article/>", None),
            EffectiveType::Xml
        );
        assert_eq!(
            sniff_type(
                b"<?xml version=\"1.0\"?><html xmlns=\"http://www.w3.org/1999/xhtml\"/>",
                None
            ),
            EffectiveType::Html
        );
    }

    #[test]
    fn test_doctype_html_with_bom_and_whitespace() {
        let body = "\u{feff}  \n<!DOCTYPE HTML><html></html>";
        assert_eq!(sniff_type(body.as_bytes(), None), EffectiveType::Html);
    }

    #[test]
    fn test_ambiguous_markup_uses_declared_type() {
        assert_eq!(
            sniff_type(b"<div>fragment</div>", Some("text/html; charset=utf-8")),
            EffectiveType::Html
        );
        assert_eq!(sniff_type(b"<article>x</article>", None), EffectiveType::Xml);
    }

    #[test]
    fn test_plain_text_and_binary() {
        assert_eq!(sniff_type(b"Abstract. We study...", None), EffectiveType::Text);
        assert_eq!(
            sniff_type(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A], Some("text/plain")),
            EffectiveType::Unknown
        );
    }

    #[test]
    fn test_utf8_cut_at_window_edge_is_still_text() {
        let mut body = "a".repeat(TEXT_WINDOW - 1).into_bytes();
        body.extend_from_slice("é".as_bytes());
        assert_eq!(sniff_type(&body, None), EffectiveType::Text);
    }
}
