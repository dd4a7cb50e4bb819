//! Site adapters, the per-unit page walker, reward normalization and device classification.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cashmap_core::{
    CategoryConfig, Device, DeviceProfile, ObservationOrder, PaginationStrategy, RawCampaign,
    SourceFormat, SourceRegistry, SourceSiteConfig,
};
use cashmap_storage::{FetchError, HttpFetcher, RequestIdentity};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub mod crawl;
pub mod device;
pub mod normalize;

pub use crawl::{crawl_unit, CrawlUnit, PageStep, PageWalker, UnitCheckpoint, UnitOutcome, UnitStatus};
pub use device::{device_signal, DeviceClassifier};
pub use normalize::{
    canonicalize_url, clean_display_name, normalize_observation, NormalizeError, Normalized,
    RewardRuleTable,
};

pub const CRATE_NAME: &str = "cashmap-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrawlError {
    /// Raised only after the fetcher's bounded backoff is exhausted.
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("blocked by {source_site} at {url}: {reason}")]
    Blocked {
        source_site: String,
        url: String,
        reason: String,
    },
    #[error("markup mismatch on {url}: {message}")]
    MarkupMismatch { url: String, message: String },
    #[error("invalid configuration for {source_site}: {message}")]
    Config { source_site: String, message: String },
}

impl CrawlError {
    fn from_fetch(source_site: &str, err: FetchError) -> Self {
        match err {
            FetchError::Blocked { status, url } => CrawlError::Blocked {
                source_site: source_site.to_string(),
                url,
                reason: format!("http status {status}"),
            },
            FetchError::HttpStatus { status, url } => CrawlError::Network {
                url,
                message: format!("http status {status}"),
            },
            FetchError::Request(err) => CrawlError::Network {
                url: err.url().map(ToString::to_string).unwrap_or_default(),
                message: err.to_string(),
            },
        }
    }

    fn config(source_site: &str, message: impl Into<String>) -> Self {
        CrawlError::Config {
            source_site: source_site.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlContext {
    pub run_id: Uuid,
    pub fetcher: Arc<HttpFetcher>,
}

/// Position of a walk: `page` is the 1-based ordinal within the unit, `url` the page to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub page: u32,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub source_site: String,
    pub category: String,
    pub unit_index: u32,
    pub profile_index: u32,
    pub profile: DeviceProfile,
    /// First page of the listing for this profile, after host override.
    pub listing_url: String,
    pub cursor: PageCursor,
}

impl PageRequest {
    fn order(&self, position: usize) -> ObservationOrder {
        ObservationOrder {
            unit_index: self.unit_index,
            profile_index: self.profile_index,
            page: self.cursor.page,
            position: position as u32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub requested_url: String,
    pub final_url: String,
    pub device: Device,
    pub body: String,
}

/// Why a walk over one listing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    NoResults,
    RepeatedPage,
    PageLimit,
    Exhausted,
    TooManyFailures,
    Blocked,
    Cancelled,
    TimedOut,
}

impl Termination {
    /// True for the ends that mean the listing was read to completion.
    pub fn is_normal(&self) -> bool {
        matches!(
            self,
            Termination::NoResults
                | Termination::RepeatedPage
                | Termination::PageLimit
                | Termination::Exhausted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPage {
    Continue(PageCursor),
    End(Termination),
}

/// Capability interface implemented once per listing format; per-source differences
/// live in [`SourceSiteConfig`].
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn config(&self) -> &SourceSiteConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    async fn fetch_page(
        &self,
        ctx: &CrawlContext,
        request: &PageRequest,
    ) -> Result<FetchedPage, CrawlError> {
        fetch_listing_page(ctx, self.config(), request).await
    }

    fn has_next_page(&self, page: &FetchedPage, request: &PageRequest) -> NextPage;

    fn extract_records(
        &self,
        page: &FetchedPage,
        request: &PageRequest,
    ) -> Result<Vec<RawCampaign>, CrawlError>;
}

pub async fn fetch_listing_page(
    ctx: &CrawlContext,
    config: &SourceSiteConfig,
    request: &PageRequest,
) -> Result<FetchedPage, CrawlError> {
    let identity = RequestIdentity::with_user_agent(request.profile.user_agent.clone());
    let response = ctx
        .fetcher
        .fetch_with_identity(ctx.run_id, &config.name, &request.cursor.url, &identity)
        .await
        .map_err(|err| CrawlError::from_fetch(&config.name, err))?;
    let body = response.text();

    if let Some(marker) = config
        .extraction
        .blocked_markers
        .iter()
        .find(|m| !m.is_empty() && body.contains(m.as_str()))
    {
        return Err(CrawlError::Blocked {
            source_site: config.name.clone(),
            url: response.final_url,
            reason: format!("blocked marker {marker:?} in body"),
        });
    }

    debug!(source = %config.name, url = %request.cursor.url, bytes = body.len(), "fetched listing page");
    Ok(FetchedPage {
        requested_url: request.cursor.url.clone(),
        final_url: response.final_url,
        device: request.profile.device,
        body,
    })
}

/// Entry URL for one category as seen by one device profile.
pub fn listing_url(
    config: &SourceSiteConfig,
    category: &CategoryConfig,
    profile: &DeviceProfile,
) -> Result<String, CrawlError> {
    let base = Url::parse(&config.base_url)
        .map_err(|e| CrawlError::config(&config.name, format!("bad base_url: {e}")))?;
    let mut url = base
        .join(&category.url)
        .map_err(|e| CrawlError::config(&config.name, format!("bad category url: {e}")))?;
    if let Some(host) = profile.host.as_deref() {
        url.set_host(Some(host))
            .map_err(|e| CrawlError::config(&config.name, format!("bad profile host: {e}")))?;
    }
    Ok(url.to_string())
}

/// Cursor for the first page, honouring `first_page_bare` for numeric pagination.
pub fn first_page_cursor(config: &SourceSiteConfig, listing_url: &str) -> Result<PageCursor, CrawlError> {
    let url = match &config.pagination.strategy {
        PaginationStrategy::Numeric {
            param,
            start,
            first_page_bare,
        } if !first_page_bare => numeric_page_url(listing_url, param, *start)
            .ok_or_else(|| CrawlError::config(&config.name, "listing url does not parse"))?,
        _ => listing_url.to_string(),
    };
    Ok(PageCursor { page: 1, url })
}

fn numeric_page_url(listing_url: &str, param: &str, value: u32) -> Option<String> {
    let mut url = Url::parse(listing_url).ok()?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, &value.to_string());
    Some(url.to_string())
}

/// Next cursor for numeric pagination, which never depends on page content. `None` for
/// continuation pagination.
pub fn numeric_next(config: &SourceSiteConfig, request: &PageRequest) -> Option<PageCursor> {
    let PaginationStrategy::Numeric { param, start, .. } = &config.pagination.strategy else {
        return None;
    };
    let next = request.cursor.page + 1;
    let url = numeric_page_url(&request.listing_url, param, start + next - 1)?;
    Some(PageCursor { page: next, url })
}

fn continuation_cursor(
    param: Option<&str>,
    token: &str,
    page: &FetchedPage,
    request: &PageRequest,
) -> Option<PageCursor> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    let url = match param {
        None => Url::parse(&page.final_url).ok()?.join(token).ok()?.to_string(),
        Some(param) => {
            let mut url = Url::parse(&request.listing_url).ok()?;
            url.query_pairs_mut().append_pair(param, token);
            url.to_string()
        }
    };
    Some(PageCursor {
        page: request.cursor.page + 1,
        url,
    })
}

fn has_no_results_marker(config: &SourceSiteConfig, page: &FetchedPage) -> bool {
    config
        .extraction
        .no_results_markers
        .iter()
        .any(|m| !m.is_empty() && page.body.contains(m.as_str()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn compile_source_key(config: &SourceSiteConfig) -> Result<Option<Regex>, CrawlError> {
    config
        .extraction
        .source_key_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| CrawlError::config(&config.name, format!("bad source_key_pattern: {e}")))
}

fn capture_source_key(pattern: Option<&Regex>, href: &str) -> Option<String> {
    let caps = pattern?.captures(href)?;
    caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str().to_string())
}

fn parse_selector(config: &SourceSiteConfig, selector: &str) -> Result<Selector, CrawlError> {
    Selector::parse(selector)
        .map_err(|e| CrawlError::config(&config.name, format!("bad selector {selector:?}: {e}")))
}

fn select_first_text(item: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    item.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(item: &ElementRef<'_>, selector: Option<&Selector>, attr: &str) -> Option<String> {
    let element = match selector {
        Some(selector) => item.select(selector).next()?,
        None => *item,
    };
    element
        .value()
        .attr(attr)
        .and_then(|s| text_or_none(s.to_string()))
}

/// HTML listing pages described entirely by CSS selectors.
#[derive(Debug)]
pub struct HtmlListingAdapter {
    config: SourceSiteConfig,
    item: Selector,
    name: Selector,
    reward: Selector,
    /// `None` when the item element itself carries the link.
    link: Option<Selector>,
    device: Option<Selector>,
    continuation: Option<Selector>,
    source_key: Option<Regex>,
}

impl HtmlListingAdapter {
    pub fn new(config: SourceSiteConfig) -> Result<Self, CrawlError> {
        let rules = &config.extraction;
        let link = if rules.link_selector.trim().is_empty() {
            None
        } else {
            Some(parse_selector(&config, &rules.link_selector)?)
        };
        let device = rules
            .device_selector
            .as_deref()
            .map(|s| parse_selector(&config, s))
            .transpose()?;
        let continuation = match &config.pagination.strategy {
            PaginationStrategy::Continuation { token_selector, .. } => {
                Some(parse_selector(&config, token_selector)?)
            }
            PaginationStrategy::Numeric { .. } => None,
        };
        Ok(Self {
            item: parse_selector(&config, &rules.item_selector)?,
            name: parse_selector(&config, &rules.name_selector)?,
            reward: parse_selector(&config, &rules.reward_selector)?,
            source_key: compile_source_key(&config)?,
            link,
            device,
            continuation,
            config,
        })
    }
}

#[async_trait]
impl SiteAdapter for HtmlListingAdapter {
    fn config(&self) -> &SourceSiteConfig {
        &self.config
    }

    fn has_next_page(&self, page: &FetchedPage, request: &PageRequest) -> NextPage {
        if has_no_results_marker(&self.config, page) {
            return NextPage::End(Termination::NoResults);
        }
        let next = match &self.config.pagination.strategy {
            PaginationStrategy::Numeric { .. } => numeric_next(&self.config, request),
            PaginationStrategy::Continuation {
                param, token_attr, ..
            } => {
                let document = Html::parse_document(&page.body);
                let token = self.continuation.as_ref().and_then(|selector| {
                    let node = document.select(selector).next()?;
                    if token_attr == "text" {
                        text_or_none(node.text().collect::<String>())
                    } else {
                        node.value().attr(token_attr).map(ToString::to_string)
                    }
                });
                token.and_then(|t| continuation_cursor(param.as_deref(), &t, page, request))
            }
        };
        next.map_or(NextPage::End(Termination::Exhausted), NextPage::Continue)
    }

    fn extract_records(
        &self,
        page: &FetchedPage,
        request: &PageRequest,
    ) -> Result<Vec<RawCampaign>, CrawlError> {
        if has_no_results_marker(&self.config, page) {
            return Ok(Vec::new());
        }
        let document = Html::parse_document(&page.body);
        let items = document.select(&self.item).collect::<Vec<_>>();
        if items.is_empty() {
            return Err(CrawlError::MarkupMismatch {
                url: page.final_url.clone(),
                message: format!("item selector {:?} matched nothing", self.config.extraction.item_selector),
            });
        }

        let rules = &self.config.extraction;
        let mut records = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            let Some(href) = select_first_attr(item, self.link.as_ref(), &rules.link_attr) else {
                continue;
            };
            let Some(name) = select_first_text(item, &self.name) else {
                continue;
            };
            records.push(RawCampaign {
                source_site: self.config.name.clone(),
                category: request.category.clone(),
                profile_device: request.profile.device,
                page_url: page.final_url.clone(),
                name_raw: name,
                reward_raw: select_first_text(item, &self.reward).unwrap_or_default(),
                device_hint: self.device.as_ref().and_then(|s| select_first_text(item, s)),
                source_key: capture_source_key(self.source_key.as_ref(), &href),
                href_raw: href,
                observed: request.order(position),
            });
        }

        if records.is_empty() {
            return Err(CrawlError::MarkupMismatch {
                url: page.final_url.clone(),
                message: format!("{} items matched but none carried a name and link", items.len()),
            });
        }
        Ok(records)
    }
}

/// Resolve a dotted path (`data.items`, `links.0.href`); the empty path is the root.
pub fn json_at<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        cur = match cur {
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => cur.get(segment)?,
        };
    }
    Some(cur)
}

fn json_text(value: &JsonValue, path: &str) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// JSON feeds; the extraction fields hold dotted paths instead of CSS selectors.
#[derive(Debug)]
pub struct JsonFeedAdapter {
    config: SourceSiteConfig,
    source_key: Option<Regex>,
}

impl JsonFeedAdapter {
    pub fn new(config: SourceSiteConfig) -> Result<Self, CrawlError> {
        Ok(Self {
            source_key: compile_source_key(&config)?,
            config,
        })
    }

    fn parse_body(&self, page: &FetchedPage) -> Result<JsonValue, CrawlError> {
        serde_json::from_str(&page.body).map_err(|e| CrawlError::MarkupMismatch {
            url: page.final_url.clone(),
            message: format!("invalid json: {e}"),
        })
    }
}

#[async_trait]
impl SiteAdapter for JsonFeedAdapter {
    fn config(&self) -> &SourceSiteConfig {
        &self.config
    }

    fn has_next_page(&self, page: &FetchedPage, request: &PageRequest) -> NextPage {
        if has_no_results_marker(&self.config, page) {
            return NextPage::End(Termination::NoResults);
        }
        let Ok(document) = self.parse_body(page) else {
            return numeric_next(&self.config, request)
                .map_or(NextPage::End(Termination::Exhausted), NextPage::Continue);
        };
        let empty = json_at(&document, &self.config.extraction.item_selector)
            .and_then(JsonValue::as_array)
            .is_some_and(Vec::is_empty);
        if empty {
            return NextPage::End(Termination::NoResults);
        }
        let next = match &self.config.pagination.strategy {
            PaginationStrategy::Numeric { .. } => numeric_next(&self.config, request),
            PaginationStrategy::Continuation {
                param,
                token_selector,
                ..
            } => json_text(&document, token_selector)
                .and_then(|t| continuation_cursor(param.as_deref(), &t, page, request)),
        };
        next.map_or(NextPage::End(Termination::Exhausted), NextPage::Continue)
    }

    fn extract_records(
        &self,
        page: &FetchedPage,
        request: &PageRequest,
    ) -> Result<Vec<RawCampaign>, CrawlError> {
        if has_no_results_marker(&self.config, page) {
            return Ok(Vec::new());
        }
        let rules = &self.config.extraction;
        let document = self.parse_body(page)?;
        let items = json_at(&document, &rules.item_selector)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| CrawlError::MarkupMismatch {
                url: page.final_url.clone(),
                message: format!("no array at {:?}", rules.item_selector),
            })?;

        let records = items
            .iter()
            .enumerate()
            .filter_map(|(position, item)| {
                let href = json_text(item, &rules.link_selector)?;
                let name = json_text(item, &rules.name_selector)?;
                Some(RawCampaign {
                    source_site: self.config.name.clone(),
                    category: request.category.clone(),
                    profile_device: request.profile.device,
                    page_url: page.final_url.clone(),
                    name_raw: name,
                    reward_raw: json_text(item, &rules.reward_selector).unwrap_or_default(),
                    device_hint: rules
                        .device_selector
                        .as_deref()
                        .and_then(|path| json_text(item, path)),
                    source_key: capture_source_key(self.source_key.as_ref(), &href),
                    href_raw: href,
                    observed: request.order(position),
                })
            })
            .collect::<Vec<_>>();

        if records.is_empty() && !items.is_empty() {
            return Err(CrawlError::MarkupMismatch {
                url: page.final_url.clone(),
                message: format!("{} items but none carried a name and link", items.len()),
            });
        }
        Ok(records)
    }
}

pub fn adapter_for_source(config: &SourceSiteConfig) -> Result<Arc<dyn SiteAdapter>, CrawlError> {
    Ok(match config.format {
        SourceFormat::Html => Arc::new(HtmlListingAdapter::new(config.clone())?),
        SourceFormat::Json => Arc::new(JsonFeedAdapter::new(config.clone())?),
    })
}

/// Adapters keyed by source name.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn SiteAdapter>>,
}

impl AdapterRegistry {
    pub fn from_sources(registry: &SourceRegistry) -> Result<Self, CrawlError> {
        let mut out = Self::default();
        for source in registry.enabled() {
            out.register(adapter_for_source(source)?);
        }
        Ok(out)
    }

    pub fn register(&mut self, adapter: Arc<dyn SiteAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SiteAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
