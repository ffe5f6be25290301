// src/loader/content.rs

//! Content loader: reconciles discovered ids into the canonical submission
//! table.
//!
//! Every pass rereads the discovery collections, refetches everything inside
//! the trailing recheck window and rewrites the canonical table sorted and
//! free of duplicates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::loader::{Loader, PassSummary, StopSignal};
use crate::models::{
    CollectionKey, ContentConfig, DiscoveryEntry, LoaderKind, RecordType, Submission, Watermark,
    normalize_community, sort_rows,
};
use crate::services::ContentSource;
use crate::storage::{TableStore, WriteOptions};
use crate::utils::fmt_time;
use crate::utils::log::LoaderLog;

/// Discovery entries due for a refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recheck {
    /// Start of the window
    pub since: DateTime<Utc>,
    pub entries: Vec<DiscoveryEntry>,
}

impl Recheck {
    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|e| e.created).max()
    }
}

/// Pick the upstream entries to refetch.
///
/// The window ends at the newest upstream entry already in the canonical
/// table, or at the oldest upstream entry when none is, and reaches `window`
/// further back. Everything created since its start is selected.
pub fn select_for_recheck(
    upstream: &[DiscoveryEntry],
    known: &HashSet<String>,
    window: chrono::Duration,
) -> Option<Recheck> {
    let anchor = upstream
        .iter()
        .filter(|e| known.contains(&e.id))
        .map(|e| e.created)
        .max()
        .or_else(|| upstream.iter().map(|e| e.created).min())?;

    let since = anchor
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    Some(Recheck {
        since,
        entries: upstream
            .iter()
            .filter(|e| e.created >= since)
            .cloned()
            .collect(),
    })
}

/// Merge fetched rows into the canonical table.
///
/// Rows missing from `canonical` are inserted; existing rows take every
/// fetched field except optional ones the fetch left empty. When `fetched`
/// holds an id twice the later row wins. The result is sorted.
pub fn merge_records(canonical: Vec<Submission>, fetched: &[Submission]) -> Vec<Submission> {
    let mut merged = Vec::with_capacity(canonical.len() + fetched.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in canonical {
        match index.get(&row.id) {
            Some(&pos) => merged[pos] = row,
            None => {
                index.insert(row.id.clone(), merged.len());
                merged.push(row);
            }
        }
    }

    for row in fetched {
        match index.get(&row.id) {
            Some(&pos) => {
                let existing: &mut Submission = &mut merged[pos];
                existing.update_from(row);
            }
            None => {
                index.insert(row.id.clone(), merged.len());
                merged.push(row.clone());
            }
        }
    }

    sort_rows(&mut merged);
    merged
}

/// Marker texts that flag a submission as removed or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalPolicy {
    removed_markers: Vec<String>,
    deleted_markers: Vec<String>,
}

impl RemovalPolicy {
    pub fn new(removed_markers: Vec<String>, deleted_markers: Vec<String>) -> Self {
        Self {
            removed_markers,
            deleted_markers,
        }
    }

    pub fn from_config(config: &ContentConfig) -> Self {
        Self::new(config.removed_markers.clone(), config.deleted_markers.clone())
    }

    /// Set the flags from the body text. Flags already set stay set.
    pub fn apply(&self, submission: &mut Submission) {
        let body = submission.selftext.trim();
        if self.removed_markers.iter().any(|m| m == body) {
            submission.removed = true;
        }
        if self.deleted_markers.iter().any(|m| m == body) {
            submission.deleted = true;
        }
    }
}

pub struct ContentLoader<S: TableStore> {
    community: String,
    config: ContentConfig,
    store: Arc<S>,
    source: Arc<dyn ContentSource>,
    policy: RemovalPolicy,
    log: LoaderLog,
    watermarks: BTreeMap<RecordType, Watermark>,
}

impl<S: TableStore> ContentLoader<S> {
    /// Build the loader and restore persisted watermarks.
    pub async fn new(
        community: &str,
        config: ContentConfig,
        store: Arc<S>,
        source: Arc<dyn ContentSource>,
    ) -> Result<Self> {
        config.validate()?;
        let community = normalize_community(community);
        if community.is_empty() {
            return Err(AppError::config("content loader needs a community"));
        }

        let mut watermarks = BTreeMap::new();
        for record_type in &config.record_types {
            record_type.canonical_schema().check::<Submission>()?;
            let key = CollectionKey::new(&community, LoaderKind::Content, *record_type);
            let metadata = store.read_metadata(&key).await?;
            watermarks.insert(
                *record_type,
                Watermark::restore(DateTime::<Utc>::UNIX_EPOCH, &metadata)?,
            );
        }

        Ok(Self {
            log: LoaderLog::new(LoaderKind::Content, &community),
            policy: RemovalPolicy::from_config(&config),
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
        CollectionKey::new(&self.community, LoaderKind::Content, record_type)
    }

    fn upstream_keys(&self, record_type: RecordType) -> Vec<CollectionKey> {
        self.config
            .upstreams
            .iter()
            .map(|upstream| {
                let community = upstream.community.as_deref().unwrap_or(&self.community);
                CollectionKey::new(community, upstream.loader, record_type)
            })
            .collect()
    }

    /// Fetch `fullnames` batch by batch.
    ///
    /// Returns `None` once `max_consecutive_errors` batches failed in a row.
    async fn fetch(&self, fullnames: &[String], signal: &StopSignal) -> Result<Option<Vec<Submission>>> {
        let batches: Vec<&[String]> = fullnames.chunks(self.config.batch_size).collect();
        let max_errors = self.config.max_consecutive_errors;
        let mut fetched = Vec::new();
        let mut consecutive = 0;
        let mut next = 0;

        while next < batches.len() {
            signal.check()?;
            match self.source.fetch(batches[next]).await {
                Ok(rows) => {
                    consecutive = 0;
                    fetched.extend(rows);
                    next += 1;
                    self.log.debug(format!("fetched batch {}/{}", next, batches.len()));
                    if next < batches.len() && signal.sleep(self.config.batch_delay()).await.is_stopped() {
                        return Err(AppError::Interrupted);
                    }
                }
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    consecutive += 1;
                    self.log.warn(format!(
                        "request error {e}, retry ({consecutive}/{max_errors})"
                    ));
                    if consecutive >= max_errors {
                        return Ok(None);
                    }
                    if signal.sleep(self.config.error_backoff()).await.is_stopped() {
                        return Err(AppError::Interrupted);
                    }
                }
            }
        }
        Ok(Some(fetched))
    }

    /// Returns rows written and whether the pass was abandoned.
    async fn download(&mut self, record_type: RecordType, signal: &StopSignal) -> Result<(usize, bool)> {
        let Some(mark) = self.watermarks.get(&record_type).cloned() else {
            return Ok((0, false));
        };
        let key = self.key(record_type);
        let canonical: Vec<Submission> = self.store.read_table(&key).await?;
        let known: HashSet<String> = canonical.iter().map(|r| r.id.clone()).collect();

        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut since: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;

        for upstream in self.upstream_keys(record_type) {
            let entries: Vec<DiscoveryEntry> = self.store.read_table(&upstream).await?;
            let Some(recheck) = select_for_recheck(&entries, &known, self.config.recheck_window()) else {
                self.log.debug(format!("no data in {upstream}"));
                continue;
            };
            self.log.info(format!(
                "update data after {} from {}",
                fmt_time(recheck.since),
                upstream
            ));

            since = Some(since.map_or(recheck.since, |s| s.min(recheck.since)));
            newest = newest.max(recheck.newest());
            ids.extend(
                recheck
                    .entries
                    .into_iter()
                    .filter(|e| seen.insert(e.id.clone()))
                    .map(|e| record_type.fullname(&e.id)),
            );
        }

        if ids.is_empty() {
            self.log.info(format!("no {record_type}s to update"));
            return Ok((0, false));
        }

        self.log.info(format!("download {} {}s", ids.len(), record_type));
        let Some(mut fetched) = self.fetch(&ids, signal).await? else {
            self.log.error(format!(
                "giving up on {record_type}s after {} consecutive errors",
                self.config.max_consecutive_errors
            ));
            return Ok((0, true));
        };
        for row in &mut fetched {
            self.policy.apply(row);
        }
        self.log.info(format!("updated {} {}s", fetched.len(), record_type));

        let merged = merge_records(canonical, &fetched);
        let options = WriteOptions::overwrite().with_snapshot(self.config.snapshot);
        self.store.write_table(&key, &merged, options).await?;

        let mut next = mark;
        if let Some(newest) = newest {
            next.advance(newest);
        }
        next.end_run = since;
        self.store.write_metadata(&key, next.to_metadata()?).await?;
        self.watermarks.insert(record_type, next);

        self.log.info(format!("exported {} {}s", merged.len(), record_type));
        Ok((merged.len(), false))
    }
}

#[async_trait]
impl<S: TableStore + 'static> Loader for ContentLoader<S> {
    fn kind(&self) -> LoaderKind {
        LoaderKind::Content
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
    use crate::models::UpstreamConfig;
    use crate::storage::LocalStore;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn entry(id: &str, created: DateTime<Utc>) -> DiscoveryEntry {
        DiscoveryEntry {
            id: id.into(),
            community: "stocks".into(),
            author: "alice".into(),
            created,
            retrieved: created,
            parent: None,
        }
    }

    fn submission(id: &str, created: i64, score: i64) -> Submission {
        Submission {
            id: id.into(),
            community: "stocks".into(),
            author: "alice".into(),
            created: at(created),
            retrieved: at(created + 10),
            title: format!("title {id}"),
            score,
            shortlink: format!("https://redd.it/{id}"),
            ..Submission::default()
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let canonical = vec![submission("a", 100, 1), submission("b", 200, 1)];
        let fetched = vec![submission("b", 200, 5), submission("c", 150, 2)];

        let once = merge_records(canonical, &fetched);
        let twice = merge_records(once.clone(), &fetched);
        assert_eq!(once, twice);

        let ids: Vec<&str> = once.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(once[2].score, 5);
    }

    #[test]
    fn test_fetched_flags_are_authoritative() {
        let canonical = vec![submission("a", 100, 1)];
        let mut removed = submission("a", 100, 1);
        removed.removed = true;

        let merged = merge_records(canonical, &[removed]);
        assert!(merged[0].removed);
    }

    #[test]
    fn test_empty_optional_fields_keep_canonical_value() {
        let mut canonical = submission("a", 100, 1);
        canonical.link_flair_text = Some("DD".into());
        canonical.edited = Some(at(150));
        let fetched = submission("a", 100, 9);

        let merged = merge_records(vec![canonical], &[fetched]);
        assert_eq!(merged[0].link_flair_text.as_deref(), Some("DD"));
        assert_eq!(merged[0].edited, Some(at(150)));
        assert_eq!(merged[0].score, 9);
    }

    #[test]
    fn test_recheck_window_from_known_anchor() {
        let t = at(1_000_000);
        let upstream = vec![
            entry("old", t - chrono::Duration::hours(10)),
            entry("recent", t - chrono::Duration::hours(1)),
            entry("anchor", t),
        ];
        let known: HashSet<String> = ["anchor".to_string()].into_iter().collect();

        let recheck = select_for_recheck(&upstream, &known, chrono::Duration::hours(8)).unwrap();
        assert_eq!(recheck.since, t - chrono::Duration::hours(8));
        let ids: Vec<&str> = recheck.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["recent", "anchor"]);
    }

    #[test]
    fn test_recheck_without_known_starts_at_oldest() {
        let upstream = vec![entry("b", at(5000)), entry("a", at(4000))];
        let recheck =
            select_for_recheck(&upstream, &HashSet::new(), chrono::Duration::hours(1)).unwrap();
        assert_eq!(recheck.since, at(4000 - 3600));
        assert_eq!(recheck.entries.len(), 2);

        assert!(select_for_recheck(&[], &HashSet::new(), chrono::Duration::hours(1)).is_none());
    }

    #[test]
    fn test_oversized_window_selects_everything() {
        let upstream = vec![entry("b", at(5000)), entry("a", at(4000))];
        let recheck =
            select_for_recheck(&upstream, &HashSet::new(), chrono::Duration::MAX).unwrap();
        assert_eq!(recheck.since, DateTime::<Utc>::MIN_UTC);
        assert_eq!(recheck.entries.len(), 2);
    }

    #[test]
    fn test_removal_policy() {
        let policy = RemovalPolicy::new(vec!["[removed]".into()], vec!["[deleted]".into()]);

        let mut removed = submission("a", 1, 1);
        removed.selftext = "[removed]".into();
        policy.apply(&mut removed);
        assert!(removed.removed && !removed.deleted);

        let mut deleted = submission("b", 1, 1);
        deleted.selftext = "[deleted]".into();
        policy.apply(&mut deleted);
        assert!(deleted.deleted && !deleted.removed);
    }

    /// Answers with canned submissions, or fails every request.
    #[derive(Default)]
    struct ScriptedContent {
        rows: Mutex<HashMap<String, Submission>>,
        requests: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl ScriptedContent {
        fn serve(&self, row: Submission) {
            self.rows
                .lock()
                .unwrap()
                .insert(RecordType::Submission.fullname(&row.id), row);
        }
    }

    #[async_trait]
    impl ContentSource for ScriptedContent {
        async fn fetch(&self, fullnames: &[String]) -> Result<Vec<Submission>> {
            self.requests.lock().unwrap().push(fullnames.to_vec());
            if self.fail {
                return Err(AppError::Api {
                    endpoint: "/api/info".into(),
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            let rows = self.rows.lock().unwrap();
            Ok(fullnames.iter().filter_map(|f| rows.get(f).cloned()).collect())
        }
    }

    fn config() -> ContentConfig {
        ContentConfig {
            record_types: vec![RecordType::Submission],
            idle_period_secs: 0,
            recheck_window_hours: 8,
            batch_size: 2,
            batch_delay_ms: 0,
            max_consecutive_errors: 3,
            error_backoff_secs: 0,
            upstreams: vec![
                UpstreamConfig {
                    loader: LoaderKind::Search,
                    community: None,
                },
                UpstreamConfig {
                    loader: LoaderKind::Crawler,
                    community: None,
                },
            ],
            removed_markers: vec!["[removed]".into()],
            deleted_markers: vec!["[deleted]".into()],
            snapshot: false,
        }
    }

    fn canonical_key() -> CollectionKey {
        CollectionKey::new("stocks", LoaderKind::Content, RecordType::Submission)
    }

    async fn seed(store: &LocalStore, loader: LoaderKind, entries: &[DiscoveryEntry]) {
        let key = CollectionKey::new("stocks", loader, RecordType::Submission);
        store
            .write_table(&key, entries, WriteOptions::append())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pass_reconciles_both_upstreams() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        seed(&store, LoaderKind::Search, &[entry("a", at(100)), entry("b", at(200))]).await;
        seed(&store, LoaderKind::Crawler, &[entry("b", at(200)), entry("c", at(300))]).await;

        let source = Arc::new(ScriptedContent::default());
        for (id, created) in [("a", 100), ("b", 200), ("c", 300)] {
            source.serve(submission(id, created, 1));
        }

        let mut loader = ContentLoader::new("stocks", config(), Arc::clone(&store), Arc::clone(&source) as Arc<dyn ContentSource>)
            .await
            .unwrap();
        let summary = loader.run_pass(&StopSignal::never()).await.unwrap();
        assert_eq!(summary.rows, 3);

        // Three ids in batches of two, "b" requested once.
        let requests = source.requests.lock().unwrap().clone();
        assert_eq!(requests, vec![vec!["t3_a".to_string(), "t3_b".into()], vec!["t3_c".into()]]);

        let rows: Vec<Submission> = store.read_table(&canonical_key()).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let mark = loader.watermark(RecordType::Submission).unwrap();
        assert_eq!(mark.last_run, at(300));
        assert_eq!(mark.end_run, Some(at(100) - chrono::Duration::hours(8)));

        // A second pass picks up changed scores without duplicating rows.
        source.serve(submission("c", 300, 42));
        loader.run_pass(&StopSignal::never()).await.unwrap();
        let rows: Vec<Submission> = store.read_table(&canonical_key()).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].score, 42);
    }

    #[tokio::test]
    async fn test_failing_source_leaves_table_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        seed(&store, LoaderKind::Search, &[entry("a", at(100))]).await;
        store
            .write_table(&canonical_key(), &[submission("a", 100, 1)], WriteOptions::overwrite())
            .await
            .unwrap();
        let before = store.collection_info(&canonical_key()).await.unwrap();

        let source = Arc::new(ScriptedContent {
            fail: true,
            ..ScriptedContent::default()
        });
        let mut loader = ContentLoader::new("stocks", config(), Arc::clone(&store), Arc::clone(&source) as Arc<dyn ContentSource>)
            .await
            .unwrap();

        let summary = loader.run_pass(&StopSignal::never()).await.unwrap();
        assert_eq!(summary.failures, 1);
        assert_eq!(source.requests.lock().unwrap().len(), 3);

        let after = store.collection_info(&canonical_key()).await.unwrap();
        assert_eq!(before.table, after.table);
        assert!(after.metadata.is_empty());
        assert_eq!(loader.watermark(RecordType::Submission).unwrap().last_run, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_stop_between_batches_is_interrupt() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        seed(&store, LoaderKind::Search, &[entry("a", at(100))]).await;

        let source = Arc::new(ScriptedContent {
            fail: true,
            ..ScriptedContent::default()
        });
        let mut config = config();
        config.error_backoff_secs = 3600;
        let mut loader = ContentLoader::new("stocks", config, Arc::clone(&store), source)
            .await
            .unwrap();

        let (handle, signal) = StopSignal::channel();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.stop();
        });

        let result = loader.run_pass(&signal).await;
        stopper.await.unwrap();
        assert!(matches!(result, Err(AppError::Interrupted)));
        assert!(store.read_metadata(&canonical_key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_content_rejects_comments() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let config = ContentConfig {
            record_types: vec![RecordType::Comment],
            ..config()
        };
        let source: Arc<dyn ContentSource> = Arc::new(ScriptedContent::default());
        let result = ContentLoader::new("stocks", config, store, source).await;
        assert!(matches!(result, Err(AppError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_counter_resets_after_success() {
        struct Flaky {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ContentSource for Flaky {
            async fn fetch(&self, fullnames: &[String]) -> Result<Vec<Submission>> {
                // Every other request fails.
                if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                    return Err(AppError::validation("flaky"));
                }
                Ok(fullnames
                    .iter()
                    .map(|f| {
                        let id = f.trim_start_matches("t3_");
                        submission(id, 100, 1)
                    })
                    .collect())
            }
        }

        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let entries: Vec<DiscoveryEntry> =
            (0..8).map(|i| entry(&format!("id{i}"), at(100 + i))).collect();
        seed(&store, LoaderKind::Crawler, &entries).await;

        let mut config = config();
        config.max_consecutive_errors = 2;
        let source = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let mut loader = ContentLoader::new("stocks", config, Arc::clone(&store), source)
            .await
            .unwrap();

        let summary = loader.run_pass(&StopSignal::never()).await.unwrap();
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.rows, 8);
    }
}
