//! Shared builders for integration tests: PDFs, tasks, schedulers and flaky responders.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use harvester_core::fallback::MirrorResolver;
use harvester_core::{
    Fetcher, FetcherOptions, Ledger, LedgerStore, RetryPolicy, Scheduler, SchedulerConfig, Task,
};
use url::Url;
use wiremock::{Request, Respond, ResponseTemplate};

/// Size of the PDF used by end-to-end scenarios.
pub const PAPER_PDF_LEN: usize = 50 * 1024;

/// Builds a structurally valid PDF with `pages` pages and at least `min_len` bytes.
pub fn pdf_bytes(pages: usize, min_len: usize) -> Vec<u8> {
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
    let count = i64::try_from(kids.len()).expect("page count fits i64");
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
    doc.save_to(&mut out).expect("PDF serializes");
    out
}

/// The 50 KB multi-page paper used across scenarios.
pub fn paper_pdf() -> Vec<u8> {
    pdf_bytes(3, PAPER_PDF_LEN)
}

pub fn task(id: &str, doi: Option<&str>, url: &str) -> Task {
    Task {
        id: id.to_string(),
        url: url.to_string(),
        doi: doi.map(str::to_string),
        author: "Smith".to_string(),
        title: "Example Study".to_string(),
        year: None,
    }
}

/// No pacing, so tests only wait on the network.
pub fn fast_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent,
        delay: Duration::ZERO,
        mirror_delay: Duration::ZERO,
        ..SchedulerConfig::default()
    }
}

/// Three requests per route with millisecond backoff.
pub fn fast_fetcher() -> Fetcher {
    Fetcher::new(
        &FetcherOptions {
            timeout: Duration::from_secs(5),
            ..FetcherOptions::default()
        },
        RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50)),
    )
    .expect("client builds")
}

pub async fn open_ledger(root: &Path) -> Arc<Ledger> {
    Arc::new(
        Ledger::open(&root.join("harvest_state.db"))
            .await
            .expect("ledger opens"),
    )
}

pub async fn scheduler(
    root: &Path,
    ledger: &Arc<Ledger>,
    config: SchedulerConfig,
    mirrors: Vec<Url>,
) -> Scheduler {
    let store: Arc<dyn LedgerStore> = Arc::clone(ledger) as Arc<dyn LedgerStore>;
    Scheduler::prepare(
        config,
        fast_fetcher(),
        MirrorResolver::new(mirrors),
        store,
        root,
    )
    .await
    .expect("scheduler prepares")
}

/// Answers `failures` times with `status`, then with `body` as a PDF.
#[derive(Clone)]
pub struct FailThenServe {
    failures: usize,
    status: u16,
    body: Vec<u8>,
    calls: Arc<AtomicUsize>,
}

impl FailThenServe {
    pub fn new(failures: usize, status: u16, body: Vec<u8>) -> Self {
        Self {
            failures,
            status,
            body,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Respond for FailThenServe {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            ResponseTemplate::new(self.status)
        } else {
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(self.body.clone())
        }
    }
}

/// Reads a JSON-lines log into values.
pub fn read_log(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).expect("log line is JSON"))
        .collect()
}
