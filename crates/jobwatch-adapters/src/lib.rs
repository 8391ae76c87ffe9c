//! Collector contracts + the careers-page HTML collector.

use async_trait::async_trait;
use jobwatch_core::{dedup_by_id, Posting};
use jobwatch_storage::{FetchError, PageFetcher};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "jobwatch-adapters";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Produces the currently visible postings for one search term. A failed
/// collection is non-fatal to the run; the pipeline recovers it as zero
/// postings for that term.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self, term: &str) -> Result<Vec<Posting>, CollectError>;
}

/// CSS selectors describing a listing page. The defaults match the iFood
/// careers page this watcher was originally written for.
#[derive(Debug, Clone)]
pub struct ListingSelectors {
    pub row: String,
    pub title_link: String,
    pub location: Option<String>,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            row: "ul.sc-ienWRC li".to_string(),
            title_link: "h4 a".to_string(),
            location: None,
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, CollectError> {
    Selector::parse(selector).map_err(|e| CollectError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Turns a scraped href into the canonical posting id: an absolute URL.
pub fn absolutize_link(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}

/// Extracts postings from listing-page HTML. Rows without a usable title
/// link are skipped with a warning; the result is deduplicated by link in
/// document order.
pub fn parse_listing(
    html: &str,
    base_url: &str,
    selectors: &ListingSelectors,
) -> Result<Vec<Posting>, CollectError> {
    let row_sel = parse_selector(&selectors.row)?;
    let title_link_sel = parse_selector(&selectors.title_link)?;
    let location_sel = selectors
        .location
        .as_deref()
        .map(parse_selector)
        .transpose()?;

    let document = Html::parse_document(html);
    let mut postings = Vec::new();
    let mut skipped = 0usize;

    for row in document.select(&row_sel) {
        let Some(link_el) = row.select(&title_link_sel).next() else {
            skipped += 1;
            continue;
        };
        let title = collapse_whitespace(&link_el.text().collect::<String>());
        let Some(href) = link_el.value().attr("href").map(str::trim) else {
            skipped += 1;
            continue;
        };
        if title.is_empty() || href.is_empty() {
            skipped += 1;
            continue;
        }

        let mut posting = Posting::new(absolutize_link(base_url, href), title);
        if let Some(location_sel) = &location_sel {
            posting.location = row
                .select(location_sel)
                .next()
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .filter(|text| !text.is_empty());
        }
        postings.push(posting);
    }

    if skipped > 0 {
        warn!(skipped, "listing rows without a valid title link");
    }

    Ok(dedup_by_id(postings))
}

/// Collector for a server-rendered careers listing page, queried with the
/// search term as a URL parameter.
pub struct CareersPageCollector {
    fetcher: PageFetcher,
    base_url: String,
    search_param: String,
    selectors: ListingSelectors,
}

impl CareersPageCollector {
    pub fn new(fetcher: PageFetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            search_param: "q".to_string(),
            selectors: ListingSelectors::default(),
        }
    }

    pub fn with_selectors(mut self, selectors: ListingSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn with_search_param(mut self, param: impl Into<String>) -> Self {
        self.search_param = param.into();
        self
    }
}

#[async_trait]
impl Collector for CareersPageCollector {
    async fn collect(&self, term: &str) -> Result<Vec<Posting>, CollectError> {
        let html = self
            .fetcher
            .fetch_text(&self.base_url, &[(self.search_param.as_str(), term)])
            .await?;
        parse_listing(&html, &self.base_url, &self.selectors)
    }
}
