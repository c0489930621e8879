//! Shared helpers for unit tests.

pub(crate) mod socket_guard;

/// Builds a structurally valid PDF with `pages` pages and at least `min_len`
/// bytes. Padding goes into the page content streams so the xref stays valid.
#[allow(clippy::unwrap_used)]
pub(crate) fn pdf_bytes(pages: usize, min_len: usize) -> Vec<u8> {
    use lopdf::{Document, Object, Stream, dictionary};

    let pad = min_len / pages.max(1) + 256;
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    for index in 0..pages {
        let mut content = format!("BT /F1 12 Tf 72 720 Td (Page {index}) Tj ET").into_bytes();
        content.extend(std::iter::repeat_n(b' ', pad));
        let content_id = doc.add_object(Stream::new(dictionary! {}, content));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(612), Object::Integer(792)],
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
    }
    let count = i64::try_from(kids.len()).unwrap();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => Object::Integer(count),
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}
