// src/loader/backfill.rs

//! Backfill loader: discovers submissions and comments through an archive's
//! time-bounded search.
//!
//! A pass covers the window between `last_run` and the time it started,
//! paging backwards with an exclusive `before` bound. Progress is persisted
//! after every page, so a window left open by an error, the page limit or a
//! stop request is finished by the next pass:
//!
//! - `cursor`: `before` bound of the next page, in unix seconds
//! - `end_run`: oldest item reached in the open window
//! - `pending_run`: top of the open window; `last_run` moves there once the
//!   window is complete

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{AppError, Result};
use crate::loader::{Loader, PassSummary, StopSignal};
use crate::models::{
    BackfillConfig, CollectionKey, DiscoveryEntry, LoaderKind, RecordType, Watermark,
    normalize_community, sort_rows,
};
use crate::services::{HistorySource, ListingItem};
use crate::storage::{TableStore, WriteOptions};
use crate::utils::log::LoaderLog;
use crate::utils::{fmt_time, now_secs};

fn one_second() -> chrono::Duration {
    chrono::Duration::seconds(1)
}

/// Why a window walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkEnd {
    Complete,
    PageLimit,
    Failed,
    Stopped,
}

pub struct BackfillLoader<S: TableStore> {
    community: String,
    config: BackfillConfig,
    store: Arc<S>,
    source: Arc<dyn HistorySource>,
    log: LoaderLog,
    watermarks: BTreeMap<RecordType, Watermark>,
}

impl<S: TableStore> BackfillLoader<S> {
    /// Build the loader and restore persisted watermarks.
    pub async fn new(
        community: &str,
        config: BackfillConfig,
        store: Arc<S>,
        source: Arc<dyn HistorySource>,
    ) -> Result<Self> {
        config.validate()?;
        let community = normalize_community(community);
        if community.is_empty() {
            return Err(AppError::config("backfill loader needs a community"));
        }

        let start = config.start()?;
        let mut watermarks = BTreeMap::new();
        for record_type in &config.record_types {
            record_type.discovery_schema().check::<DiscoveryEntry>()?;
            let key = CollectionKey::new(&community, LoaderKind::Backfill, *record_type);
            let metadata = store.read_metadata(&key).await?;
            watermarks.insert(*record_type, Watermark::restore(start, &metadata)?);
        }

        Ok(Self {
            log: LoaderLog::new(LoaderKind::Backfill, &community),
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
        CollectionKey::new(&self.community, LoaderKind::Backfill, record_type)
    }

    /// Ids already stored at or above `before - 1s`; a resumed window
    /// refetches that second.
    async fn stored_ids(&self, record_type: RecordType, before: DateTime<Utc>) -> Result<HashSet<String>> {
        let rows: Vec<DiscoveryEntry> = self.store.read_table(&self.key(record_type)).await?;
        let from = before - one_second();
        Ok(rows
            .into_iter()
            .filter(|r| r.created >= from)
            .map(|r| r.id)
            .collect())
    }

    fn entries(&self, items: Vec<ListingItem>) -> Vec<DiscoveryEntry> {
        let retrieved = now_secs();
        items
            .into_iter()
            .map(|item| DiscoveryEntry {
                id: item.id,
                community: self.community.clone(),
                author: item.author,
                retrieved: retrieved.max(item.created),
                created: item.created,
                parent: item.parent,
            })
            .collect()
    }

    /// Returns rows written and whether the walk failed.
    async fn download(&mut self, record_type: RecordType, signal: &StopSignal) -> Result<(usize, bool)> {
        let Some(mark) = self.watermarks.get(&record_type).cloned() else {
            return Ok((0, false));
        };
        let key = self.key(record_type);
        let floor = mark.last_run;

        let resume = match (mark.pending_run, mark.cursor.as_deref()) {
            (Some(top), Some(cursor)) => match parse_cursor(cursor) {
                Some(before) => Some((top, before)),
                None => {
                    self.log.warn(format!("ignoring unreadable cursor {cursor}"));
                    None
                }
            },
            _ => None,
        };
        let (top, mut before, mut seen) = match resume {
            Some((top, before)) => {
                self.log.info(format!(
                    "resume {}s below {} down to {}",
                    record_type,
                    fmt_time(before),
                    fmt_time(floor)
                ));
                (top, before, self.stored_ids(record_type, before).await?)
            }
            None => {
                let top = now_secs();
                self.log.info(format!(
                    "backfill {}s between {} and {}",
                    record_type,
                    fmt_time(floor),
                    fmt_time(top)
                ));
                (top, top + one_second(), HashSet::new())
            }
        };

        let mut next = mark.clone();
        let mut persisted = mark;
        let mut written = 0;
        let mut pages = 0;

        let end = loop {
            if signal.is_stopped() {
                break WalkEnd::Stopped;
            }
            if pages >= self.config.max_pages {
                break WalkEnd::PageLimit;
            }

            let items = match self
                .source
                .search_window(&self.community, record_type, floor, before)
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    self.log.warn(format!("request error {e}, retry next pass"));
                    if signal.sleep(self.config.error_backoff()).await.is_stopped() {
                        break WalkEnd::Stopped;
                    }
                    break WalkEnd::Failed;
                }
            };
            pages += 1;

            let Some(oldest) = items.iter().map(|i| i.created).min() else {
                break WalkEnd::Complete;
            };
            let fresh: Vec<ListingItem> = items
                .into_iter()
                .filter(|i| i.created > floor && i.created < before)
                .filter(|i| seen.insert(i.id.clone()))
                .collect();

            // The next page includes the oldest second again, unless this
            // page brought nothing new from it.
            before = if fresh.is_empty() {
                oldest
            } else {
                oldest + one_second()
            };

            let mut rows = self.entries(fresh);
            if !rows.is_empty() {
                sort_rows(&mut rows);
                let options = WriteOptions::append().with_snapshot(self.config.snapshot);
                self.store.write_table(&key, &rows, options).await?;
                written += rows.len();
            }

            next.cursor = Some(before.timestamp().to_string());
            next.pending_run = Some(top);
            next.end_run = Some(next.end_run.map_or(oldest, |e| e.min(oldest)));
            self.store.write_metadata(&key, next.to_metadata()?).await?;
            persisted = next.clone();
            self.watermarks.insert(record_type, next.clone());

            self.log.info(format!(
                "fetched {} {}s after {}",
                written,
                record_type,
                fmt_time(oldest)
            ));

            if signal.sleep(self.config.page_delay()).await.is_stopped() {
                break WalkEnd::Stopped;
            }
        };

        if end == WalkEnd::Complete {
            next.advance(top);
            next.clear_resume();
        }
        if next != persisted {
            self.store.write_metadata(&key, next.to_metadata()?).await?;
        }
        if next.is_resuming() {
            self.log.info(format!(
                "window incomplete, resume below {} next pass",
                next.cursor.as_deref().unwrap_or_default()
            ));
        }
        self.watermarks.insert(record_type, next);
        self.log.info(format!("saved {} {}s", written, record_type));

        match end {
            WalkEnd::Stopped => Err(AppError::Interrupted),
            WalkEnd::Failed => Ok((written, true)),
            WalkEnd::Complete | WalkEnd::PageLimit => Ok((written, false)),
        }
    }
}

fn parse_cursor(cursor: &str) -> Option<DateTime<Utc>> {
    let secs = cursor.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

#[async_trait]
impl<S: TableStore + 'static> Loader for BackfillLoader<S> {
    fn kind(&self) -> LoaderKind {
        LoaderKind::Backfill
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StopHandle;
    use crate::storage::LocalStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// Archive holding one item every 100s from 100 to 1000, served in pages
    /// of `page_size`.
    struct Archive {
        created: Vec<i64>,
        page_size: usize,
        calls: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
        fail_call: Option<usize>,
        stop_after_first: Option<StopHandle>,
    }

    impl Archive {
        fn new(page_size: usize) -> Self {
            Self {
                created: (1..=10).map(|n| n * 100).collect(),
                page_size,
                calls: Mutex::new(Vec::new()),
                fail_call: None,
                stop_after_first: None,
            }
        }

        fn calls(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HistorySource for Archive {
        async fn search_window(
            &self,
            _community: &str,
            record_type: RecordType,
            after: DateTime<Utc>,
            before: DateTime<Utc>,
        ) -> Result<Vec<ListingItem>> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((after, before));
                calls.len()
            };
            if self.fail_call == Some(call) {
                return Err(AppError::parse("/reddit/submission/search", "boom"));
            }
            if let Some(handle) = &self.stop_after_first {
                handle.stop();
            }

            let mut created: Vec<i64> = self
                .created
                .iter()
                .copied()
                .filter(|c| at(*c) > after && at(*c) < before)
                .collect();
            created.sort_unstable_by(|a, b| b.cmp(a));
            Ok(created
                .into_iter()
                .take(self.page_size)
                .map(|c| ListingItem {
                    id: format!("id{c}"),
                    author: "alice".into(),
                    created: at(c),
                    parent: (record_type == RecordType::Comment).then(|| "abc".to_string()),
                })
                .collect())
        }
    }

    fn config(max_pages: usize) -> BackfillConfig {
        BackfillConfig {
            record_types: vec![RecordType::Submission],
            start_time: 50,
            base_url: "https://api.pushshift.io".into(),
            idle_period_secs: 0,
            page_delay_ms: 0,
            error_backoff_secs: 0,
            max_pages,
            snapshot: false,
        }
    }

    fn key(record_type: RecordType) -> CollectionKey {
        CollectionKey::new("stocks", LoaderKind::Backfill, record_type)
    }

    async fn stored_ids(store: &LocalStore) -> Vec<String> {
        let rows: Vec<DiscoveryEntry> = store.read_table(&key(RecordType::Submission)).await.unwrap();
        let mut ids: Vec<String> = rows.into_iter().map(|r| r.id).collect();
        ids.sort();
        ids
    }

    fn all_ids() -> Vec<String> {
        let mut ids: Vec<String> = (1..=10).map(|n| format!("id{}", n * 100)).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_complete_window_advances_watermark() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let source = Arc::new(Archive::new(3));
        let mut loader = BackfillLoader::new(
            "stocks",
            config(40),
            Arc::clone(&store),
            Arc::clone(&source) as Arc<dyn HistorySource>,
        )
        .await
        .unwrap();

        let started = now_secs();
        let summary = loader.run_pass(&StopSignal::never()).await.unwrap();
        assert_eq!(summary.rows, 10);
        assert_eq!(summary.failures, 0);
        assert_eq!(stored_ids(&store).await, all_ids());

        let mark = loader.watermark(RecordType::Submission).unwrap().clone();
        assert!(mark.last_run >= started);
        assert!(!mark.is_resuming());
        assert!(source.calls().iter().all(|(after, _)| *after == at(50)));

        // The next pass only covers the time since.
        let summary = loader.run_pass(&StopSignal::never()).await.unwrap();
        assert_eq!(summary.rows, 0);
        let (after, _) = *source.calls().last().unwrap();
        assert_eq!(after, mark.last_run);
        assert_eq!(stored_ids(&store).await, all_ids());
    }

    #[tokio::test]
    async fn test_open_window_resumes_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let source: Arc<dyn HistorySource> = Arc::new(Archive::new(3));

        let mut loader = BackfillLoader::new("stocks", config(2), Arc::clone(&store), Arc::clone(&source))
            .await
            .unwrap();
        let summary = loader.run_pass(&StopSignal::never()).await.unwrap();
        assert_eq!(summary.rows, 5);
        assert_eq!(summary.failures, 0);

        let first = loader.watermark(RecordType::Submission).unwrap().clone();
        assert_eq!(first.last_run, at(50));
        assert_eq!(first.cursor.as_deref(), Some("601"));
        assert_eq!(first.end_run, Some(at(600)));
        let top = first.pending_run.unwrap();

        // Restarted loaders pick the open window up from the store.
        let mut passes = 0;
        loop {
            let mut loader =
                BackfillLoader::new("stocks", config(2), Arc::clone(&store), Arc::clone(&source))
                    .await
                    .unwrap();
            loader.run_pass(&StopSignal::never()).await.unwrap();
            passes += 1;
            let mark = loader.watermark(RecordType::Submission).unwrap();
            if !mark.is_resuming() {
                assert_eq!(mark.last_run, top);
                break;
            }
            assert!(passes < 5, "window never completed");
        }

        let rows: Vec<DiscoveryEntry> = store.read_table(&key(RecordType::Submission)).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(stored_ids(&store).await, all_ids());
    }

    #[tokio::test]
    async fn test_failed_page_keeps_progress() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let mut archive = Archive::new(3);
        archive.fail_call = Some(2);
        let source = Arc::new(archive);

        let mut loader = BackfillLoader::new(
            "stocks",
            config(40),
            Arc::clone(&store),
            Arc::clone(&source) as Arc<dyn HistorySource>,
        )
        .await
        .unwrap();

        let summary = loader.run_pass(&StopSignal::never()).await.unwrap();
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.rows, 3);
        let mark = loader.watermark(RecordType::Submission).unwrap().clone();
        assert_eq!(mark.last_run, at(50));
        assert_eq!(mark.cursor.as_deref(), Some("801"));

        // The retry starts where the failed request left off.
        let summary = loader.run_pass(&StopSignal::never()).await.unwrap();
        assert_eq!(summary.failures, 0);
        assert_eq!(source.calls()[2].1, at(801));
        assert_eq!(stored_ids(&store).await, all_ids());
        assert_eq!(
            loader.watermark(RecordType::Submission).unwrap().last_run,
            mark.pending_run.unwrap()
        );
    }

    #[tokio::test]
    async fn test_stop_persists_open_window() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let (handle, signal) = StopSignal::channel();
        let mut archive = Archive::new(3);
        archive.stop_after_first = Some(handle);

        let mut config = config(40);
        config.page_delay_ms = 3_600_000;
        let mut loader = BackfillLoader::new("stocks", config, Arc::clone(&store), Arc::new(archive))
            .await
            .unwrap();

        let result = loader.run_pass(&signal).await;
        assert!(matches!(result, Err(AppError::Interrupted)));

        let metadata = store.read_metadata(&key(RecordType::Submission)).await.unwrap();
        let mark = Watermark::restore(at(0), &metadata).unwrap();
        assert_eq!(mark.last_run, at(50));
        assert_eq!(mark.cursor.as_deref(), Some("801"));
        assert_eq!(stored_ids(&store).await.len(), 3);
    }

    #[tokio::test]
    async fn test_comments_keep_their_parent() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let mut config = config(40);
        config.record_types = vec![RecordType::Comment];
        let mut loader = BackfillLoader::new("stocks", config, Arc::clone(&store), Arc::new(Archive::new(100)))
            .await
            .unwrap();

        loader.run_pass(&StopSignal::never()).await.unwrap();
        let rows: Vec<DiscoveryEntry> = store.read_table(&key(RecordType::Comment)).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|r| r.parent.as_deref() == Some("abc")));
        assert!(store.read_table::<DiscoveryEntry>(&key(RecordType::Submission)).await.unwrap().is_empty());
    }

    #[test]
    fn test_parse_cursor() {
        assert_eq!(parse_cursor("601"), Some(at(601)));
        assert_eq!(parse_cursor("https://old.reddit.com/r/x/new/"), None);
    }
}
