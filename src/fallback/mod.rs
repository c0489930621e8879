//! Mirror fallback routes keyed by DOI.
//!
//! When the Direct route cannot satisfy a task, each configured mirror is
//! tried in order with the candidate URL `<mirror>/<doi>`. A mirror may answer
//! with the PDF itself or with a landing page embedding it; in the latter case
//! the embedded link is followed once. Mirror routes only accept PDF content.

mod page;

use tracing::{debug, instrument};
use url::Url;

use crate::fetch::{FetchContext, FetchedBody, Fetcher, PDF_ACCEPT, RateLimiter, failure_outcome};
use crate::task::{AttemptOutcome, RouteAttempt, SourceRoute};
use crate::user_agent::BROWSER_USER_AGENT;
use crate::verify::{ContentPolicy, EffectiveType, RejectReason, sniff_type};

pub use page::{absolutize_url, extract_document_link, is_captcha_page};

const DOI_URL_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
];

/// Normalizes a DOI: strips resolver URL and `doi:` prefixes, URL-decodes,
/// trims. Returns `None` when nothing remains.
#[must_use]
pub fn normalize_doi(input: &str) -> Option<String> {
    let mut doi = input.trim();

    for prefix in DOI_URL_PREFIXES {
        if doi
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        {
            doi = &doi[prefix.len()..];
            break;
        }
    }

    if doi.get(..4).is_some_and(|head| head.eq_ignore_ascii_case("doi:")) {
        doi = doi[4..].trim_start();
    }

    let decoded = match urlencoding::decode(doi) {
        Ok(decoded) => decoded.trim().to_string(),
        Err(_) => doi.trim().to_string(),
    };
    (!decoded.is_empty()).then_some(decoded)
}

/// True for landing-page or resolver URLs that never serve the file itself.
#[must_use]
pub fn is_non_document_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return false;
    };
    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    if host == "doi.org" || host == "dx.doi.org" {
        return true;
    }
    let path = parsed.path().to_ascii_lowercase();
    path.contains("/doi/abs/") || path.trim_end_matches('/').ends_with("/abstract")
}

/// One mirror candidate for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorCandidate {
    pub route: SourceRoute,
    pub url: String,
}

/// Ordered list of mirror services.
#[derive(Debug, Clone, Default)]
pub struct MirrorResolver {
    mirrors: Vec<Url>,
}

impl MirrorResolver {
    #[must_use]
    pub fn new(mirrors: Vec<Url>) -> Self {
        Self { mirrors }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    /// Candidate URLs for `doi`, one per mirror in priority order.
    #[must_use]
    pub fn candidates(&self, doi: &str) -> Vec<MirrorCandidate> {
        let encoded = doi
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        self.mirrors
            .iter()
            .map(|base| MirrorCandidate {
                route: SourceRoute::FallbackMirror(mirror_domain(base)),
                url: format!("{}/{encoded}", base.as_str().trim_end_matches('/')),
            })
            .collect()
    }

    /// Attempts one mirror candidate: Fetch, follow an embedded link if the
    /// mirror answered with a page, then Verify as PDF.
    #[instrument(skip(self, fetcher, limiter, policy), fields(route = %candidate.route, url = %candidate.url))]
    pub async fn attempt(
        &self,
        candidate: &MirrorCandidate,
        fetcher: &Fetcher,
        limiter: &RateLimiter,
        policy: &ContentPolicy,
    ) -> RouteAttempt {
        let ctx = FetchContext::new(limiter).with_user_agent(BROWSER_USER_AGENT);
        let route = candidate.route.clone();

        let report = fetcher.fetch(&candidate.url, ctx).await;
        let mut retries = report.retries();
        let page = match report.result {
            Ok(page) => page,
            Err(error) => {
                return RouteAttempt {
                    route,
                    url: candidate.url.clone(),
                    outcome: failure_outcome(&error),
                    retries,
                };
            }
        };

        let page_type = sniff_type(&page.body, page.content_type.as_deref());
        let (url, outcome) = match page_type {
            EffectiveType::Pdf => (candidate.url.clone(), pdf_outcome(page, policy, &route).await),
            EffectiveType::Html | EffectiveType::Xml => {
                let html = String::from_utf8_lossy(&page.body);
                let base = Url::parse(&page.final_url)
                    .ok()
                    .or_else(|| Url::parse(&candidate.url).ok());
                if is_captcha_page(&html) {
                    debug!("mirror answered with a captcha");
                    (
                        candidate.url.clone(),
                        AttemptOutcome::RejectedContent(RejectReason::Captcha),
                    )
                } else if let Some(link) =
                    base.and_then(|base| extract_document_link(&html, &base))
                {
                    debug!(link = %link, "following embedded document link");
                    let report = fetcher.fetch(&link, ctx.expecting(PDF_ACCEPT)).await;
                    retries += report.retries();
                    let outcome = match report.result {
                        Ok(document) => pdf_outcome(document, policy, &route).await,
                        Err(error) => failure_outcome(&error),
                    };
                    (link, outcome)
                } else {
                    (
                        candidate.url.clone(),
                        AttemptOutcome::RejectedContent(RejectReason::NoDocumentLink),
                    )
                }
            }
            other => (
                candidate.url.clone(),
                AttemptOutcome::RejectedContent(RejectReason::NotPdf(other)),
            ),
        };

        RouteAttempt {
            route,
            url,
            outcome,
            retries,
        }
    }
}

fn mirror_domain(base: &Url) -> String {
    let host = base.host_str().unwrap_or("unknown").to_ascii_lowercase();
    match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

async fn pdf_outcome(
    fetched: FetchedBody,
    policy: &ContentPolicy,
    route: &SourceRoute,
) -> AttemptOutcome {
    let (body, verdict) = policy.judge_owned(fetched.body, fetched.content_type).await;
    match verdict {
        Ok(EffectiveType::Pdf) => AttemptOutcome::Success {
            effective_type: EffectiveType::Pdf,
            body,
            route: route.clone(),
        },
        Ok(other) => AttemptOutcome::RejectedContent(RejectReason::NotPdf(other)),
        Err(reason) => AttemptOutcome::RejectedContent(reason),
    }
}
