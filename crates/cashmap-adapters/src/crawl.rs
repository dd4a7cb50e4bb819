//! Sequential page walking for one (source × category) crawl unit.

use std::sync::Arc;
use std::time::Duration;

use cashmap_core::{CategoryConfig, Device, RawCampaign};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    first_page_cursor, listing_url, numeric_next, CrawlContext, CrawlError, NextPage, PageCursor,
    PageRequest, SiteAdapter, Termination,
};

/// Consecutive skipped pages after which a walk gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct CrawlUnit {
    pub source: String,
    pub category: CategoryConfig,
    /// Position of the unit in configuration order; feeds observation ordering.
    pub unit_index: u32,
}

#[derive(Debug)]
pub enum PageStep {
    Records {
        cursor: PageCursor,
        records: Vec<RawCampaign>,
    },
    Skipped {
        cursor: PageCursor,
        error: CrawlError,
    },
    Finished(Termination),
}

/// Lazy, restartable walk over one device view of a listing. Pages are fetched strictly
/// one after another: the next request is only known once the current page is inspected.
pub struct PageWalker {
    adapter: Arc<dyn SiteAdapter>,
    template: PageRequest,
    cursor: Option<PageCursor>,
    fetched: u32,
    previous_fingerprint: Option<String>,
    consecutive_failures: u32,
    termination: Option<Termination>,
    delay_first: bool,
}

impl PageWalker {
    pub fn new(
        adapter: Arc<dyn SiteAdapter>,
        unit: &CrawlUnit,
        profile_index: usize,
    ) -> Result<Self, CrawlError> {
        let config = adapter.config();
        let profile = config
            .profiles()
            .get(profile_index)
            .cloned()
            .ok_or_else(|| CrawlError::Config {
                source_site: config.name.clone(),
                message: format!("no device profile #{profile_index}"),
            })?;
        let listing = listing_url(config, &unit.category, &profile)?;
        let cursor = first_page_cursor(config, &listing)?;
        let template = PageRequest {
            source_site: config.name.clone(),
            category: unit.category.key.clone(),
            unit_index: unit.unit_index,
            profile_index: profile_index as u32,
            profile,
            listing_url: listing,
            cursor: cursor.clone(),
        };
        Ok(Self {
            adapter,
            template,
            cursor: Some(cursor),
            fetched: 0,
            previous_fingerprint: None,
            consecutive_failures: 0,
            termination: None,
            delay_first: false,
        })
    }

    /// Continue a walk from a checkpointed cursor.
    pub fn resume(
        adapter: Arc<dyn SiteAdapter>,
        unit: &CrawlUnit,
        profile_index: usize,
        cursor: PageCursor,
    ) -> Result<Self, CrawlError> {
        let mut walker = Self::new(adapter, unit, profile_index)?;
        walker.cursor = Some(cursor);
        Ok(walker)
    }

    /// Page the next call will fetch, `None` once the walk has ended.
    pub fn cursor(&self) -> Option<&PageCursor> {
        if self.termination.is_some() {
            None
        } else {
            self.cursor.as_ref()
        }
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn device(&self) -> Device {
        self.template.profile.device
    }

    pub fn profile_index(&self) -> u32 {
        self.template.profile_index
    }

    pub fn pages_fetched(&self) -> u32 {
        self.fetched
    }

    /// Pause before the first request too, for walks that follow earlier requests to the
    /// same source.
    pub fn delay_first_request(&mut self) {
        self.delay_first = true;
    }

    fn finish(&mut self, termination: Termination) -> PageStep {
        self.termination = Some(termination);
        self.cursor = None;
        PageStep::Finished(termination)
    }

    async fn polite_delay(&self) {
        let delay = self.adapter.config().delay;
        let (lo, hi) = (delay.min_ms.min(delay.max_ms), delay.min_ms.max(delay.max_ms));
        let millis = if hi == 0 { 0 } else { rand::random_range(lo..=hi) };
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn skip(&mut self, cursor: PageCursor, error: CrawlError, next: Option<PageCursor>) -> PageStep {
        self.consecutive_failures += 1;
        warn!(
            source = %self.template.source_site,
            page = cursor.page,
            url = %cursor.url,
            error = %error,
            "skipping page"
        );
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            self.termination = Some(Termination::TooManyFailures);
            self.cursor = None;
        } else {
            self.cursor = next;
            if self.cursor.is_none() {
                self.termination = Some(Termination::Exhausted);
            }
        }
        PageStep::Skipped { cursor, error }
    }

    /// Fetch and extract the next page. `Err` only for unit-fatal conditions (blocking,
    /// unusable configuration); everything else is reported as a step.
    pub async fn next_page(&mut self, ctx: &CrawlContext) -> Result<PageStep, CrawlError> {
        if let Some(termination) = self.termination {
            return Ok(PageStep::Finished(termination));
        }
        let Some(cursor) = self.cursor.clone() else {
            return Ok(self.finish(Termination::Exhausted));
        };
        if cursor.page > self.adapter.config().pagination.max_pages {
            return Ok(self.finish(Termination::PageLimit));
        }

        if self.fetched > 0 || self.delay_first {
            self.delay_first = false;
            self.polite_delay().await;
        }
        let mut request = self.template.clone();
        request.cursor = cursor.clone();
        self.fetched += 1;

        let page = match self.adapter.fetch_page(ctx, &request).await {
            Ok(page) => page,
            Err(err @ CrawlError::Network { .. }) => {
                let next = numeric_next(self.adapter.config(), &request);
                return Ok(self.skip(cursor, err, next));
            }
            Err(err) => {
                let termination = match &err {
                    CrawlError::Blocked { .. } => Termination::Blocked,
                    _ => Termination::TooManyFailures,
                };
                self.finish(termination);
                return Err(err);
            }
        };

        let records = match self.adapter.extract_records(&page, &request) {
            Ok(records) => records,
            Err(err @ CrawlError::MarkupMismatch { .. }) => {
                let next = match self.adapter.has_next_page(&page, &request) {
                    NextPage::Continue(next) => Some(next),
                    NextPage::End(_) => None,
                };
                return Ok(self.skip(cursor, err, next));
            }
            Err(err) => {
                self.finish(Termination::TooManyFailures);
                return Err(err);
            }
        };
        self.consecutive_failures = 0;

        let fingerprint = record_fingerprint(&records);
        if !records.is_empty() && self.previous_fingerprint.as_deref() == Some(fingerprint.as_str())
        {
            return Ok(self.finish(Termination::RepeatedPage));
        }
        self.previous_fingerprint = Some(fingerprint);

        match self.adapter.has_next_page(&page, &request) {
            NextPage::Continue(next) => self.cursor = Some(next),
            NextPage::End(termination) => {
                self.termination = Some(termination);
                self.cursor = None;
            }
        }
        Ok(PageStep::Records { cursor, records })
    }
}

/// Order-independent digest of a page's records, used to spot sources that keep serving
/// the last page for out-of-range page numbers.
pub fn record_fingerprint(records: &[RawCampaign]) -> String {
    let mut lines = records
        .iter()
        .map(|r| format!("{}\u{1f}{}\u{1f}{}", r.href_raw, r.name_raw, r.reward_raw))
        .collect::<Vec<_>>();
    lines.sort();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Every profile was read to a normal end without losing a page to the network.
    Completed,
    Failed,
    Blocked,
    TimedOut,
    Cancelled,
}

/// Where an interrupted unit stopped, for [`PageWalker::resume`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCheckpoint {
    pub profile_index: u32,
    pub cursor: PageCursor,
}

#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub source: String,
    pub category: String,
    pub unit_index: u32,
    pub status: UnitStatus,
    pub records: Vec<RawCampaign>,
    pub pages_fetched: u32,
    pub pages_skipped: u32,
    pub network_failures: u32,
    pub terminations: Vec<(Device, Termination)>,
    pub checkpoint: Option<UnitCheckpoint>,
    pub errors: Vec<String>,
}

impl UnitOutcome {
    fn new(unit: &CrawlUnit) -> Self {
        Self {
            source: unit.source.clone(),
            category: unit.category.key.clone(),
            unit_index: unit.unit_index,
            status: UnitStatus::Completed,
            records: Vec::new(),
            pages_fetched: 0,
            pages_skipped: 0,
            network_failures: 0,
            terminations: Vec::new(),
            checkpoint: None,
            errors: Vec::new(),
        }
    }

    /// A unit whose crawl never produced an outcome of its own.
    pub fn failed(unit: &CrawlUnit, error: impl Into<String>) -> Self {
        let mut outcome = Self::new(unit);
        outcome.status = UnitStatus::Failed;
        outcome.errors.push(error.into());
        outcome
    }

    /// Only complete units may count absences against stored records.
    pub fn is_complete(&self) -> bool {
        self.status == UnitStatus::Completed
    }
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Crawl every device profile of one unit in turn. Records extracted before a
/// cancellation, timeout or block are kept in the outcome.
pub async fn crawl_unit(
    ctx: &CrawlContext,
    adapter: Arc<dyn SiteAdapter>,
    unit: &CrawlUnit,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> UnitOutcome {
    let span = info_span!("crawl_unit", source = %unit.source, category = %unit.category.key);
    crawl_unit_inner(ctx, adapter, unit, cancel, deadline)
        .instrument(span)
        .await
}

async fn crawl_unit_inner(
    ctx: &CrawlContext,
    adapter: Arc<dyn SiteAdapter>,
    unit: &CrawlUnit,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> UnitOutcome {
    let mut outcome = UnitOutcome::new(unit);
    let profile_count = adapter.config().profiles().len();

    'profiles: for profile_index in 0..profile_count {
        let mut walker = match PageWalker::new(adapter.clone(), unit, profile_index) {
            Ok(walker) => walker,
            Err(err) => {
                outcome.status = UnitStatus::Failed;
                outcome.errors.push(err.to_string());
                break;
            }
        };
        if outcome.pages_fetched > 0 {
            walker.delay_first_request();
        }

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Interrupt::Cancelled),
                _ = wait_for_deadline(deadline) => Err(Interrupt::TimedOut),
                step = walker.next_page(ctx) => Ok(step),
            };

            match step {
                Err(interrupt) => {
                    outcome.pages_fetched += walker.pages_fetched();
                    outcome.checkpoint = walker.cursor().cloned().map(|cursor| UnitCheckpoint {
                        profile_index: walker.profile_index(),
                        cursor,
                    });
                    let (status, termination) = match interrupt {
                        Interrupt::Cancelled => (UnitStatus::Cancelled, Termination::Cancelled),
                        Interrupt::TimedOut => (UnitStatus::TimedOut, Termination::TimedOut),
                    };
                    warn!(status = ?status, records = outcome.records.len(), "unit interrupted");
                    outcome.status = status;
                    outcome.terminations.push((walker.device(), termination));
                    break 'profiles;
                }
                Ok(Err(err)) => {
                    outcome.pages_fetched += walker.pages_fetched();
                    outcome.errors.push(err.to_string());
                    let blocked = matches!(err, CrawlError::Blocked { .. });
                    outcome.terminations.push((
                        walker.device(),
                        walker.termination().unwrap_or(Termination::TooManyFailures),
                    ));
                    if blocked {
                        warn!(error = %err, "unit blocked; aborting");
                        outcome.status = UnitStatus::Blocked;
                        break 'profiles;
                    }
                    outcome.status = UnitStatus::Failed;
                    continue 'profiles;
                }
                Ok(Ok(PageStep::Records { records, .. })) => outcome.records.extend(records),
                Ok(Ok(PageStep::Skipped { error, .. })) => {
                    outcome.pages_skipped += 1;
                    if matches!(error, CrawlError::Network { .. }) {
                        outcome.network_failures += 1;
                    }
                    outcome.errors.push(error.to_string());
                }
                Ok(Ok(PageStep::Finished(termination))) => {
                    outcome.pages_fetched += walker.pages_fetched();
                    outcome.terminations.push((walker.device(), termination));
                    if !termination.is_normal() && outcome.status == UnitStatus::Completed {
                        outcome.status = UnitStatus::Failed;
                    }
                    continue 'profiles;
                }
            }
        }
    }

    if outcome.status == UnitStatus::Completed && outcome.network_failures > 0 {
        outcome.status = UnitStatus::Failed;
    }
    info!(
        status = ?outcome.status,
        records = outcome.records.len(),
        pages = outcome.pages_fetched,
        skipped = outcome.pages_skipped,
        "unit finished"
    );
    outcome
}
