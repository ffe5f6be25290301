// src/loader/crawler.rs

//! Crawler loader: discovers submissions and comments by sweeping a
//! community's newest-first listing backwards in time.
//!
//! A sweep starts at the first listing page and follows `next` links until it
//! reaches items at or below the watermark. A sweep that ends early (error,
//! page limit, stop request) leaves `last_run` untouched and records where to
//! pick up instead:
//!
//! - `cursor`: first page not fetched yet
//! - `end_run`: oldest item reached so far
//! - `pending_run`: newest item of the interrupted sweep
//!
//! The next pass finishes that sweep first, then starts a fresh one.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::loader::{Loader, PassSummary, StopSignal};
use crate::models::{
    CollectionKey, CrawlerConfig, DiscoveryEntry, LoaderKind, RecordType, Watermark,
    normalize_community, sort_rows,
};
use crate::services::{ListingItem, ListingSource, listing_url};
use crate::storage::{TableStore, WriteOptions};
use crate::utils::log::LoaderLog;
use crate::utils::{fmt_time, now_secs};

/// Why a sweep ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepEnd {
    /// A page reached items at or below the boundary
    Caught,
    /// The listing has no further page
    Exhausted,
    /// `max_pages` were fetched; `resume_url` is the next page
    PageLimit { resume_url: String },
    /// Fetching `resume_url` failed
    Failed { resume_url: String },
    /// A stop was requested before `resume_url` was fetched
    Stopped { resume_url: String },
}

impl SweepEnd {
    /// True when everything down to the boundary was seen.
    pub fn is_complete(&self) -> bool {
        matches!(self, SweepEnd::Caught | SweepEnd::Exhausted)
    }

    pub fn resume_url(&self) -> Option<&str> {
        match self {
            SweepEnd::Caught | SweepEnd::Exhausted => None,
            SweepEnd::PageLimit { resume_url }
            | SweepEnd::Failed { resume_url }
            | SweepEnd::Stopped { resume_url } => Some(resume_url),
        }
    }
}

/// Pacing of a sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    pub max_pages: usize,
    pub page_delay: Duration,
    pub error_backoff: Duration,
}

impl From<&CrawlerConfig> for SweepOptions {
    fn from(config: &CrawlerConfig) -> Self {
        Self {
            max_pages: config.max_pages,
            page_delay: config.page_delay(),
            error_backoff: config.error_backoff(),
        }
    }
}

/// Items collected by one sweep, in listing order.
#[derive(Debug, Clone)]
pub struct Sweep {
    pub items: Vec<ListingItem>,
    pub pages: usize,
    pub end: SweepEnd,
}

impl Sweep {
    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.items.iter().map(|i| i.created).max()
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.items.iter().map(|i| i.created).min()
    }
}

/// Sweep a listing from `start_url` down to `boundary`.
///
/// Errors are logged and end the sweep; the caller decides what to persist.
pub async fn sweep(
    source: &dyn ListingSource,
    start_url: &str,
    record_type: RecordType,
    boundary: DateTime<Utc>,
    options: SweepOptions,
    signal: &StopSignal,
    log: &LoaderLog,
) -> Sweep {
    let mut items = Vec::new();
    let mut pages = 0;
    let mut url = start_url.to_string();

    let end = loop {
        if signal.is_stopped() {
            break SweepEnd::Stopped { resume_url: url };
        }

        let page = match source.fetch_page(&url, record_type).await {
            Ok(page) => page,
            Err(e) => {
                log.warn(format!("request error {e}, retry"));
                signal.sleep(options.error_backoff).await;
                break SweepEnd::Failed { resume_url: url };
            }
        };
        pages += 1;

        // Listing order decides the boundary; the head of a page can hold
        // items that are out of time order.
        let tail = page.items.last().map(|i| i.created);
        let oldest = page.items.iter().map(|i| i.created).min();
        items.extend(page.items);
        if let Some(oldest) = oldest {
            log.info(format!(
                "fetched {} {}s after {}",
                items.len(),
                record_type,
                fmt_time(oldest)
            ));
        }

        let woke = signal.sleep(options.page_delay).await;

        if tail.is_some_and(|t| t <= boundary) {
            break SweepEnd::Caught;
        }
        let Some(next) = page.next else {
            break SweepEnd::Exhausted;
        };
        if pages >= options.max_pages {
            break SweepEnd::PageLimit { resume_url: next };
        }
        if woke.is_stopped() {
            break SweepEnd::Stopped { resume_url: next };
        }
        url = next;
    };

    Sweep { items, pages, end }
}

pub struct CrawlerLoader<S: TableStore> {
    community: String,
    config: CrawlerConfig,
    store: Arc<S>,
    source: Arc<dyn ListingSource>,
    log: LoaderLog,
    watermarks: BTreeMap<RecordType, Watermark>,
}

impl<S: TableStore> CrawlerLoader<S> {
    /// Build the loader and restore persisted watermarks.
    pub async fn new(
        community: &str,
        config: CrawlerConfig,
        store: Arc<S>,
        source: Arc<dyn ListingSource>,
    ) -> Result<Self> {
        config.validate()?;
        let community = normalize_community(community);
        if community.is_empty() {
            return Err(AppError::config("crawler loader needs a community"));
        }

        let start = config.start()?;
        let mut watermarks = BTreeMap::new();
        for record_type in &config.record_types {
            record_type.discovery_schema().check::<DiscoveryEntry>()?;
            let key = CollectionKey::new(&community, LoaderKind::Crawler, *record_type);
            let metadata = store.read_metadata(&key).await?;
            watermarks.insert(*record_type, Watermark::restore(start, &metadata)?);
        }

        Ok(Self {
            log: LoaderLog::new(LoaderKind::Crawler, &community),
            community,
            config,
            store,
            source,
            watermarks,
        })
    }

    pub fn watermark(&self, record_type: RecordType) -> Option<&Watermark> {
        self.watermarks.get(&record_type)
    }

    fn key(&self, record_type: RecordType) -> CollectionKey {
        CollectionKey::new(&self.community, LoaderKind::Crawler, record_type)
    }

    async fn sweep_from(
        &self,
        url: &str,
        record_type: RecordType,
        boundary: DateTime<Utc>,
        signal: &StopSignal,
    ) -> Sweep {
        sweep(
            self.source.as_ref(),
            url,
            record_type,
            boundary,
            SweepOptions::from(&self.config),
            signal,
            &self.log,
        )
        .await
    }

    /// Turn swept items into discovery rows above `boundary`.
    fn entries(
        &self,
        sweep: &Sweep,
        boundary: DateTime<Utc>,
        seen: &mut HashSet<String>,
    ) -> Vec<DiscoveryEntry> {
        let retrieved = now_secs();
        sweep
            .items
            .iter()
            .filter(|item| item.created > boundary)
            .filter(|item| seen.insert(item.id.clone()))
            .map(|item| DiscoveryEntry {
                id: item.id.clone(),
                community: self.community.clone(),
                author: item.author.clone(),
                created: item.created,
                retrieved: retrieved.max(item.created),
                parent: item.parent.clone(),
            })
            .collect()
    }

    /// Returns rows written and whether the sweep ended early.
    async fn download(&mut self, record_type: RecordType, signal: &StopSignal) -> Result<(usize, bool)> {
        let Some(mark) = self.watermarks.get(&record_type).cloned() else {
            return Ok((0, false));
        };
        let mut next = mark.clone();
        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        let mut end = SweepEnd::Caught;

        if let Some(cursor) = mark.cursor.clone() {
            self.log.info(format!(
                "resume {}s from {} down to {}",
                record_type,
                cursor,
                fmt_time(mark.last_run)
            ));
            let resumed = self
                .sweep_from(&cursor, record_type, mark.last_run, signal)
                .await;
            rows.extend(self.entries(&resumed, mark.last_run, &mut seen));

            if resumed.end.is_complete() {
                let pending = mark.pending_run.or_else(|| resumed.newest());
                if let Some(pending) = pending {
                    next.advance(pending);
                }
                next.clear_resume();
            } else {
                if let Some(url) = resumed.end.resume_url() {
                    next.cursor = Some(url.to_string());
                }
                next.end_run = min_time(mark.end_run, resumed.oldest());
            }
            end = resumed.end;
        }

        if end.is_complete() {
            let boundary = next.last_run;
            self.log.info(format!(
                "download {}s after {}",
                record_type,
                fmt_time(boundary)
            ));
            let url = listing_url(&self.config.base_url, &self.community, record_type);
            let fresh = self.sweep_from(&url, record_type, boundary, signal).await;
            rows.extend(self.entries(&fresh, boundary, &mut seen));

            if fresh.end.is_complete() {
                if let Some(newest) = fresh.newest() {
                    next.advance(newest);
                }
            } else if let (Some(url), Some(newest)) = (fresh.end.resume_url(), fresh.newest()) {
                // Only worth resuming if the sweep got anywhere.
                next.cursor = Some(url.to_string());
                next.end_run = fresh.oldest();
                next.pending_run = Some(newest);
            }
            end = fresh.end;
        }

        let written = self.persist(record_type, rows, &mark, next).await?;

        match end {
            SweepEnd::Stopped { .. } => Err(AppError::Interrupted),
            SweepEnd::Failed { .. } => Ok((written, true)),
            _ => Ok((written, false)),
        }
    }

    /// Append new rows, then store the watermark if anything changed.
    async fn persist(
        &mut self,
        record_type: RecordType,
        mut rows: Vec<DiscoveryEntry>,
        previous: &Watermark,
        next: Watermark,
    ) -> Result<usize> {
        let key = self.key(record_type);
        sort_rows(&mut rows);

        if !rows.is_empty() {
            let options = WriteOptions::append().with_snapshot(self.config.snapshot);
            self.store.write_table(&key, &rows, options).await?;
        }
        if &next != previous {
            self.store.write_metadata(&key, next.to_metadata()?).await?;
            if next.is_resuming() {
                self.log.info(format!(
                    "sweep incomplete, resume from {} next pass",
                    next.cursor.as_deref().unwrap_or_default()
                ));
            }
        }
        self.watermarks.insert(record_type, next);

        self.log.info(format!("saved {} {}s", rows.len(), record_type));
        Ok(rows.len())
    }
}

fn min_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[async_trait]
impl<S: TableStore + 'static> Loader for CrawlerLoader<S> {
    fn kind(&self) -> LoaderKind {
        LoaderKind::Crawler
    }

    fn community(&self) -> &str {
        &self.community
    }

    fn idle_period(&self) -> Duration {
        self.config.idle_period()
    }

    async fn run_pass(&mut self, signal: &StopSignal) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        for record_type in self.config.record_types.clone() {
            signal.check()?;
            let (rows, failed) = self.download(record_type, signal).await?;
            summary.record(rows, failed);
        }
        Ok(summary)
    }
}
