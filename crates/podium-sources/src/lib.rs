//! Source fetcher contracts, YAML source configuration, and the three
//! reference fetchers: an HTML listings board, a paginated JSON API, and
//! a third-party crawl-feed export.
//!
//! Fetchers never throw across the boundary: every outcome, including a
//! partially parsed page, comes back as a [`FetchOutcome`] value.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use podium_core::{Candidate, AGGREGATE_SOURCE_TAG};
use podium_store::{FetchError, HttpFetcher, PoliteDelay};
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "podium-sources";

pub const CONF_BOARD_TAG: &str = "conf-board";
pub const SPEAKER_WIRE_TAG: &str = "speaker-wire";
pub const CRAWL_FEED_TAG: &str = "crawl-feed";

/// Hard ceiling on paginated API walks; a source advertising more pages
/// than this is misbehaving.
const MAX_API_PAGES: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HtmlBoard,
    JsonApi,
    CrawlFeed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub tag: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    pub listing_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistryFile {
    pub sources: Vec<SourceConfig>,
}

pub fn load_source_configs(path: impl AsRef<Path>) -> anyhow::Result<Vec<SourceConfig>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: SourceRegistryFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.sources)
}

#[derive(Debug, Error)]
pub enum SourceFetchError {
    #[error("source responded with status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("network failure: {0}")]
    Network(String),
    #[error("unparseable content: {0}")]
    Malformed(String),
    #[error("time budget exceeded: {0}")]
    Timeout(String),
}

impl From<FetchError> for SourceFetchError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, url } => SourceFetchError::Status { status, url },
            FetchError::Request(e) if e.is_timeout() => SourceFetchError::Timeout(e.to_string()),
            FetchError::Request(e) => SourceFetchError::Network(e.to_string()),
        }
    }
}

/// What one fetch attempt produced. `error` alongside non-empty
/// `candidates` means a partial result: the parsed listings are still
/// worth persisting even though the source run counts as failed.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub candidates: Vec<Candidate>,
    pub error: Option<SourceFetchError>,
}

impl FetchOutcome {
    pub fn ok(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            error: None,
        }
    }

    pub fn failed(error: SourceFetchError) -> Self {
        Self {
            candidates: Vec::new(),
            error: Some(error),
        }
    }

    pub fn partial(candidates: Vec<Candidate>, error: SourceFetchError) -> Self {
        Self {
            candidates,
            error: Some(error),
        }
    }
}

/// One external origin of listings. Implementations normalize raw source
/// shapes into [`Candidate`] values and enforce their own polite-crawl
/// pacing through the shared [`PoliteDelay`].
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn tag(&self) -> &'static str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        delay: &PoliteDelay,
        config: &SourceConfig,
    ) -> FetchOutcome;
}

/// Typed map from source tag to fetcher, populated at startup. Keeps the
/// orchestrator's iteration closed over a known trait instead of stringly
/// dispatch.
#[derive(Default, Clone)]
pub struct FetcherRegistry {
    fetchers: BTreeMap<String, Arc<dyn SourceFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ConfBoardFetcher));
        registry.register(Arc::new(SpeakerWireFetcher));
        registry.register(Arc::new(CrawlFeedFetcher));
        registry
    }

    pub fn register(&mut self, fetcher: Arc<dyn SourceFetcher>) {
        let tag = fetcher.tag();
        if tag == AGGREGATE_SOURCE_TAG {
            warn!(tag, "refusing to register fetcher under the reserved aggregate tag");
            return;
        }
        self.fetchers.insert(tag.to_string(), fetcher);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn SourceFetcher>> {
        self.fetchers.get(tag).cloned()
    }

    pub fn tags(&self) -> Vec<String> {
        self.fetchers.keys().cloned().collect()
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(root: &scraper::ElementRef<'_>, selector: &Selector) -> Option<String> {
    root.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// "$500 - $1,500" style fee text into an explicit (min, max) range.
fn parse_fee_range(text: &str) -> (Option<f64>, Option<f64>) {
    let nums = extract_numbers(&text.replace(',', ""));
    let min = nums.first().copied();
    let max = nums.get(1).copied().or(min);
    (min, max)
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    for format in ["%Y-%m-%d", "%B %d, %Y", "%d %b %Y", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    None
}

fn resolve_url(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let trimmed_base = base.trim_end_matches('/');
    if let Some(rest) = href.strip_prefix('/') {
        // Keep only scheme://host from the base.
        let origin = trimmed_base
            .find("://")
            .and_then(|i| trimmed_base[i + 3..].find('/').map(|j| &trimmed_base[..i + 3 + j]))
            .unwrap_or(trimmed_base);
        return format!("{origin}/{rest}");
    }
    format!("{trimmed_base}/{href}")
}

/// Public HTML listings board. One request for the whole board; every
/// `.cfp-item` block becomes a candidate, with unknown fields left empty.
#[derive(Debug, Clone, Copy)]
pub struct ConfBoardFetcher;

impl ConfBoardFetcher {
    pub fn parse_listing(
        &self,
        base_url: &str,
        html_text: &str,
    ) -> Result<Vec<Candidate>, SourceFetchError> {
        let parse = |s: &str| {
            Selector::parse(s).map_err(|e| SourceFetchError::Malformed(e.to_string()))
        };
        let item_sel = parse(".cfp-item")?;
        let title_sel = parse("h2 a, h2")?;
        let link_sel = parse("h2 a[href]")?;
        let organizer_sel = parse(".organizer")?;
        let email_sel = parse(".organizer-email")?;
        let summary_sel = parse(".summary")?;
        let location_sel = parse(".location")?;
        let audience_sel = parse(".audience")?;
        let fee_sel = parse(".fee")?;
        let event_date_sel = parse(".event-date")?;
        let deadline_sel = parse(".deadline")?;

        let document = Html::parse_document(html_text);
        let mut candidates = Vec::new();
        for item in document.select(&item_sel) {
            let Some(name) = select_first_text(&item, &title_sel) else {
                // A block without a title is noise, not a candidate.
                continue;
            };
            let source_url = item
                .select(&link_sel)
                .next()
                .and_then(|n| n.value().attr("href"))
                .map(|href| resolve_url(base_url, href));
            let (fee_min, fee_max) = select_first_text(&item, &fee_sel)
                .map(|t| parse_fee_range(&t))
                .unwrap_or((None, None));
            candidates.push(Candidate {
                source_url,
                name,
                organizer_name: select_first_text(&item, &organizer_sel),
                organizer_email: select_first_text(&item, &email_sel),
                description: select_first_text(&item, &summary_sel),
                location: select_first_text(&item, &location_sel),
                audience_size: select_first_text(&item, &audience_sel)
                    .and_then(|t| extract_numbers(&t.replace(',', "")).first().map(|v| *v as u32)),
                fee_min,
                fee_max,
                event_date: select_first_text(&item, &event_date_sel).and_then(|t| parse_date(&t)),
                submission_deadline: select_first_text(&item, &deadline_sel)
                    .and_then(|t| parse_date(&t)),
                source_tag: CONF_BOARD_TAG.to_string(),
            });
        }

        if candidates.is_empty() {
            return Err(SourceFetchError::Malformed(
                "no cfp-item blocks found in listing page".into(),
            ));
        }
        Ok(candidates)
    }
}

#[async_trait]
impl SourceFetcher for ConfBoardFetcher {
    fn tag(&self) -> &'static str {
        CONF_BOARD_TAG
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        delay: &PoliteDelay,
        config: &SourceConfig,
    ) -> FetchOutcome {
        delay.pause(self.tag()).await;
        let response = match http.fetch_bytes(self.tag(), &config.listing_url).await {
            Ok(response) => response,
            Err(err) => return FetchOutcome::failed(err.into()),
        };
        let body = String::from_utf8_lossy(&response.body);
        match self.parse_listing(&config.listing_url, &body) {
            Ok(candidates) => FetchOutcome::ok(candidates),
            Err(err) => FetchOutcome::failed(err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpeakerWirePage {
    #[serde(default)]
    opportunities: Vec<SpeakerWireRow>,
    #[serde(default)]
    next_page: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SpeakerWireRow {
    title: Option<String>,
    url: Option<String>,
    organizer: Option<String>,
    contact_email: Option<String>,
    summary: Option<String>,
    city: Option<String>,
    expected_attendees: Option<u32>,
    honorarium_min: Option<f64>,
    honorarium_max: Option<f64>,
    event_on: Option<String>,
    closes_on: Option<String>,
}

/// Paginated JSON API. Walks `?page=N` sequentially with the polite
/// delay between page requests; a failure mid-walk keeps the pages that
/// already parsed (partial result plus error).
#[derive(Debug, Clone, Copy)]
pub struct SpeakerWireFetcher;

impl SpeakerWireFetcher {
    pub fn parse_page(&self, body: &str) -> Result<(Vec<Candidate>, Option<u64>), SourceFetchError> {
        let page: SpeakerWirePage = serde_json::from_str(body)
            .map_err(|e| SourceFetchError::Malformed(format!("invalid api page: {e}")))?;
        let candidates = page
            .opportunities
            .into_iter()
            .filter_map(|row| {
                let name = row.title?;
                Some(Candidate {
                    source_url: row.url,
                    name,
                    organizer_name: row.organizer,
                    organizer_email: row.contact_email,
                    description: row.summary,
                    location: row.city,
                    audience_size: row.expected_attendees,
                    fee_min: row.honorarium_min,
                    fee_max: row.honorarium_max.or(row.honorarium_min),
                    event_date: row.event_on.as_deref().and_then(parse_date),
                    submission_deadline: row.closes_on.as_deref().and_then(parse_date),
                    source_tag: SPEAKER_WIRE_TAG.to_string(),
                })
            })
            .collect();
        Ok((candidates, page.next_page))
    }
}

#[async_trait]
impl SourceFetcher for SpeakerWireFetcher {
    fn tag(&self) -> &'static str {
        SPEAKER_WIRE_TAG
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        delay: &PoliteDelay,
        config: &SourceConfig,
    ) -> FetchOutcome {
        let mut candidates = Vec::new();
        let mut page = 1u64;

        loop {
            delay.pause(self.tag()).await;
            let url = format!("{}?page={}", config.listing_url, page);
            let response = match http.fetch_bytes(self.tag(), &url).await {
                Ok(response) => response,
                Err(err) if candidates.is_empty() => return FetchOutcome::failed(err.into()),
                Err(err) => return FetchOutcome::partial(candidates, err.into()),
            };
            let body = String::from_utf8_lossy(&response.body).into_owned();
            let (mut parsed, next) = match self.parse_page(&body) {
                Ok(parsed) => parsed,
                Err(err) if candidates.is_empty() => return FetchOutcome::failed(err),
                Err(err) => return FetchOutcome::partial(candidates, err),
            };
            candidates.append(&mut parsed);

            match next {
                Some(next_page) if next_page > page && next_page <= MAX_API_PAGES => {
                    page = next_page;
                }
                Some(next_page) => {
                    warn!(next_page, "api advertised an out-of-range next page; stopping walk");
                    break;
                }
                None => break,
            }
        }

        FetchOutcome::ok(candidates)
    }
}

/// Export from a third-party crawling service: a JSON array of crawl
/// items with loosely nested payloads. Individually broken rows are
/// skipped; the rest survive as a partial result.
#[derive(Debug, Clone, Copy)]
pub struct CrawlFeedFetcher;

impl CrawlFeedFetcher {
    fn row_to_candidate(item: &JsonValue) -> Option<Candidate> {
        let data = item.get("data")?;
        let name = data.get("event_name").and_then(|v| v.as_str())?.to_string();
        let fee_text = data.get("compensation").and_then(|v| v.as_str());
        let (fee_min, fee_max) = fee_text.map(parse_fee_range).unwrap_or((None, None));
        Some(Candidate {
            source_url: item
                .get("url")
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
            name,
            organizer_name: data
                .get("host")
                .and_then(|v| v.get("name"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
            organizer_email: data
                .get("host")
                .and_then(|v| v.get("email"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
            description: data
                .get("details")
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
            location: data
                .get("venue")
                .and_then(|v| v.get("city"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
            audience_size: data
                .get("audience")
                .and_then(|v| v.as_u64())
                .map(|v| v.min(u32::MAX as u64) as u32),
            fee_min,
            fee_max,
            event_date: data
                .get("starts")
                .and_then(|v| v.as_str())
                .and_then(parse_date),
            submission_deadline: data
                .get("cfp_deadline")
                .and_then(|v| v.as_str())
                .and_then(parse_date),
            source_tag: CRAWL_FEED_TAG.to_string(),
        })
    }

    pub fn parse_feed(&self, body: &str) -> FetchOutcome {
        let rows: Vec<JsonValue> = match serde_json::from_str(body) {
            Ok(rows) => rows,
            Err(e) => {
                return FetchOutcome::failed(SourceFetchError::Malformed(format!(
                    "crawl feed is not a JSON array: {e}"
                )))
            }
        };

        let total = rows.len();
        let candidates: Vec<Candidate> =
            rows.iter().filter_map(Self::row_to_candidate).collect();
        let skipped = total - candidates.len();

        if candidates.is_empty() && total > 0 {
            FetchOutcome::failed(SourceFetchError::Malformed(format!(
                "all {total} crawl rows were unparseable"
            )))
        } else if skipped > 0 {
            FetchOutcome::partial(
                candidates,
                SourceFetchError::Malformed(format!("{skipped} of {total} crawl rows unparseable")),
            )
        } else {
            FetchOutcome::ok(candidates)
        }
    }
}

#[async_trait]
impl SourceFetcher for CrawlFeedFetcher {
    fn tag(&self) -> &'static str {
        CRAWL_FEED_TAG
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        delay: &PoliteDelay,
        config: &SourceConfig,
    ) -> FetchOutcome {
        delay.pause(self.tag()).await;
        let response = match http.fetch_bytes(self.tag(), &config.listing_url).await {
            Ok(response) => response,
            Err(err) => return FetchOutcome::failed(err.into()),
        };
        self.parse_feed(&String::from_utf8_lossy(&response.body))
    }
}
