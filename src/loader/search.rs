// src/loader/search.rs

//! Search loader: discovers submissions through a global full-text search
//! for `r/{community}`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::loader::{Loader, PassSummary, StopSignal};
use crate::models::{
    CollectionKey, DiscoveryEntry, LoaderKind, RecordType, SearchConfig, Watermark,
    normalize_community, sort_rows,
};
use crate::services::SearchSource;
use crate::storage::{TableStore, WriteOptions};
use crate::utils::log::LoaderLog;
use crate::utils::{fmt_time, now_secs};

pub struct SearchLoader<S: TableStore> {
    community: String,
    config: SearchConfig,
    store: Arc<S>,
    source: Arc<dyn SearchSource>,
    log: LoaderLog,
    watermarks: BTreeMap<RecordType, Watermark>,
}

impl<S: TableStore> SearchLoader<S> {
    /// Build the loader and restore persisted watermarks.
    pub async fn new(
        community: &str,
        config: SearchConfig,
        store: Arc<S>,
        source: Arc<dyn SearchSource>,
    ) -> Result<Self> {
        config.validate()?;
        let community = normalize_community(community);
        if community.is_empty() {
            return Err(AppError::config("search loader needs a community"));
        }

        let start = config.start()?;
        let mut watermarks = BTreeMap::new();
        for record_type in &config.record_types {
            record_type.discovery_schema().check::<DiscoveryEntry>()?;
            let key = CollectionKey::new(&community, LoaderKind::Search, *record_type);
            let metadata = store.read_metadata(&key).await?;
            watermarks.insert(*record_type, Watermark::restore(start, &metadata)?);
        }

        Ok(Self {
            log: LoaderLog::new(LoaderKind::Search, &community),
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
        CollectionKey::new(&self.community, LoaderKind::Search, record_type)
    }

    /// Follow result pages until known data, the last page or `max_pages`.
    async fn fetch(
        &self,
        record_type: RecordType,
        last_run: chrono::DateTime<chrono::Utc>,
        signal: &StopSignal,
    ) -> Result<Vec<DiscoveryEntry>> {
        let query = format!("r/{}", self.community);
        let retrieved = now_secs();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut after: Option<String> = None;

        for _ in 0..self.config.max_pages {
            signal.check()?;
            let page = self
                .source
                .search(&query, record_type, after.as_deref())
                .await?;

            let reached_known = page.hits.iter().any(|hit| hit.created <= last_run);
            for hit in page.hits {
                if seen.insert(hit.id.clone()) {
                    entries.push(DiscoveryEntry {
                        id: hit.id,
                        community: hit.community,
                        author: hit.author,
                        created: hit.created,
                        retrieved: retrieved.max(hit.created),
                        parent: None,
                    });
                }
            }

            after = page.after;
            if reached_known || after.is_none() {
                break;
            }
        }

        if let Some(oldest) = entries.iter().map(|e| e.created).min() {
            self.log.info(format!(
                "fetched {} {}s after {}",
                entries.len(),
                record_type,
                fmt_time(oldest)
            ));
        }
        Ok(entries)
    }

    /// Returns rows written and whether the fetch failed.
    async fn download(&mut self, record_type: RecordType, signal: &StopSignal) -> Result<(usize, bool)> {
        let Some(mark) = self.watermarks.get(&record_type).cloned() else {
            return Ok((0, false));
        };
        self.log.info(format!(
            "download {}s after {}",
            record_type,
            fmt_time(mark.last_run)
        ));

        let entries = match self.fetch(record_type, mark.last_run, signal).await {
            Ok(entries) => entries,
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                self.log.warn(format!("request error {e}, retry"));
                signal.sleep(self.config.backoff()).await;
                return Ok((0, true));
            }
        };

        let mut rows: Vec<DiscoveryEntry> = entries
            .into_iter()
            .filter(|e| e.community == self.community && e.created > mark.last_run)
            .collect();
        if rows.is_empty() {
            self.log.info(format!("exported 0 {record_type}s"));
            return Ok((0, false));
        }
        sort_rows(&mut rows);

        let mut next = mark.clone();
        if let Some(newest) = rows.last().map(|r| r.created) {
            next.advance(newest);
        }

        let key = self.key(record_type);
        let options = WriteOptions::append().with_snapshot(self.config.snapshot);
        self.store.write_table(&key, &rows, options).await?;
        self.store.write_metadata(&key, next.to_metadata()?).await?;
        self.watermarks.insert(record_type, next);

        self.log.info(format!("exported {} {}s", rows.len(), record_type));
        Ok((rows.len(), false))
    }
}

#[async_trait]
impl<S: TableStore + 'static> Loader for SearchLoader<S> {
    fn kind(&self) -> LoaderKind {
        LoaderKind::Search
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
