// src/pipeline/fetch.rs

//! Fetch supervisor.
//!
//! Builds the enabled loaders for every community and drives them:
//! - `once`: loaders run one after another, one pass each, community by
//!   community; the export step follows a full round when it is due
//! - `continuous`: every loader runs as its own task until shutdown, with
//!   the export step on its interval
//!
//! A shutdown stops every running loader, aborts those that do not stop in
//! time and returns `Interrupted`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::error::{AppError, Result};
use crate::loader::{
    BackfillLoader, ContentLoader, CrawlerLoader, Loader, LoaderHandle, SearchLoader, StopSignal,
};
use crate::models::{Config, LoaderKind, RunMode, normalize_community};
use crate::pipeline::export::{PublishTimer, run_export};
use crate::services::{
    ContentSource, HistoryApi, HistorySource, HtmlListing, ListingSource, RedditApi,
    SearchSource,
};
use crate::storage::TableStore;
use crate::utils::log::{LoaderLog, banner, summary};

/// How often continuous mode checks whether an export is due.
const PUBLISH_POLL: Duration = Duration::from_secs(1);

/// Upstream clients shared by every loader.
#[derive(Clone, Default)]
pub struct Sources {
    pub search: Option<Arc<dyn SearchSource>>,
    pub listing: Option<Arc<dyn ListingSource>>,
    pub content: Option<Arc<dyn ContentSource>>,
    pub history: Option<Arc<dyn HistorySource>>,
}

impl Sources {
    /// Build the clients the enabled loaders need.
    ///
    /// API credentials are only required when the search or content loader
    /// is enabled.
    pub fn connect(config: &Config) -> Result<Self> {
        let mut sources = Sources::default();

        if config.search.is_some() || config.content.is_some() {
            let api = Arc::new(RedditApi::from_env(&config.http)?);
            if config.search.is_some() {
                sources.search = Some(api.clone());
            }
            if config.content.is_some() {
                sources.content = Some(api);
            }
        }
        if config.crawler.is_some() {
            sources.listing = Some(Arc::new(HtmlListing::new(&config.http)?));
        }
        if let Some(backfill) = &config.backfill {
            sources.history = Some(Arc::new(HistoryApi::new(&config.http, &backfill.base_url)?));
        }
        Ok(sources)
    }
}

fn require<T: ?Sized>(source: &Option<Arc<T>>, kind: LoaderKind) -> Result<Arc<T>> {
    source
        .clone()
        .ok_or_else(|| AppError::config(format!("no source configured for the {kind} loader")))
}

/// Build one enabled loader for `community`.
pub async fn build_loader<S: TableStore + 'static>(
    config: &Config,
    kind: LoaderKind,
    community: &str,
    store: &Arc<S>,
    sources: &Sources,
) -> Result<Box<dyn Loader>> {
    let disabled = || AppError::config(format!("the {kind} loader is not configured"));
    let store = Arc::clone(store);
    let loader: Box<dyn Loader> = match kind {
        LoaderKind::Search => {
            let search = config.search.clone().ok_or_else(disabled)?;
            let source = require(&sources.search, kind)?;
            Box::new(SearchLoader::new(community, search, store, source).await?)
        }
        LoaderKind::Crawler => {
            let crawler = config.crawler.clone().ok_or_else(disabled)?;
            let source = require(&sources.listing, kind)?;
            Box::new(CrawlerLoader::new(community, crawler, store, source).await?)
        }
        LoaderKind::Backfill => {
            let backfill = config.backfill.clone().ok_or_else(disabled)?;
            let source = require(&sources.history, kind)?;
            Box::new(BackfillLoader::new(community, backfill, store, source).await?)
        }
        LoaderKind::Content => {
            let content = config.content.clone().ok_or_else(disabled)?;
            let source = require(&sources.content, kind)?;
            Box::new(ContentLoader::new(community, content, store, source).await?)
        }
    };
    Ok(loader)
}

/// Build the enabled loaders for one community, in configuration order.
pub async fn build_loaders<S: TableStore + 'static>(
    config: &Config,
    community: &str,
    store: &Arc<S>,
    sources: &Sources,
) -> Result<Vec<Box<dyn Loader>>> {
    let mut loaders = Vec::new();
    for kind in config.enabled_loaders() {
        loaders.push(build_loader(config, kind, community, store, sources).await?);
    }
    Ok(loaders)
}

/// Configuration mistakes end the supervisor; anything else only costs the
/// affected loader.
fn is_fatal(e: &AppError) -> bool {
    matches!(
        e,
        AppError::Config(_) | AppError::Validation(_) | AppError::Unsupported { .. }
    )
}

/// Counters of a supervisor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Completed rounds over all communities
    pub rounds: usize,
    /// Loader runs that finished
    pub runs: usize,
    /// Loader runs that ended with an error
    pub failures: usize,
    pub exports: usize,
}

/// Run the enabled loaders for `communities` until done or shut down.
pub async fn run_fetch<S: TableStore + 'static>(
    config: &Config,
    communities: &[String],
    store: Arc<S>,
    sources: &Sources,
    shutdown: &StopSignal,
) -> Result<FetchSummary> {
    if communities.is_empty() {
        return Err(AppError::config("no communities to fetch"));
    }
    banner("STARTED");

    let result = match config.supervisor.mode {
        RunMode::Once => run_rounds(config, communities, &store, sources, shutdown).await,
        RunMode::Continuous => run_continuous(config, communities, &store, sources, shutdown).await,
    };

    match &result {
        Ok(stats) => summary(
            "fetch",
            &[
                ("rounds", stats.rounds.to_string()),
                ("runs", stats.runs.to_string()),
                ("failures", stats.failures.to_string()),
                ("exports", stats.exports.to_string()),
            ],
        ),
        Err(e) if e.is_interrupted() => banner("TERMINATED"),
        Err(e) => log::error!("fetch error {e}"),
    }
    banner("STOPPED");
    result
}

async fn run_rounds<S: TableStore + 'static>(
    config: &Config,
    communities: &[String],
    store: &Arc<S>,
    sources: &Sources,
    shutdown: &StopSignal,
) -> Result<FetchSummary> {
    let mut stats = FetchSummary::default();
    let mut timer = PublishTimer::new(Duration::from_secs(config.publish.interval_secs));
    let rounds = config.supervisor.rounds;

    while rounds == 0 || stats.rounds < rounds {
        for community in communities {
            let log = LoaderLog::named("main", community);
            for kind in config.enabled_loaders() {
                let loader = match build_loader(config, kind, community, store, sources).await {
                    Ok(loader) => loader,
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => {
                        stats.failures += 1;
                        log.error(format!("cannot start {kind} loader: {e}"));
                        continue;
                    }
                };
                let handle = LoaderHandle::spawn(loader, RunMode::Once);

                let interrupted = tokio::select! {
                    _ = handle.wait() => false,
                    _ = shutdown.stopped() => true,
                };
                if interrupted {
                    stop_all(vec![handle], config.supervisor.stop_timeout()).await;
                    return Err(AppError::Interrupted);
                }

                stats.runs += 1;
                match handle.join().await {
                    Ok(()) => {}
                    Err(e) if e.is_interrupted() => return Err(e),
                    Err(e) => {
                        stats.failures += 1;
                        log.error(format!("loader error {e}"));
                    }
                }
            }

            if !config.supervisor.pause().is_zero() {
                banner("PAUSING");
                if shutdown.sleep(config.supervisor.pause()).await.is_stopped() {
                    return Err(AppError::Interrupted);
                }
            }
            shutdown.check()?;
        }

        stats.rounds += 1;
        if timer.is_due() {
            publish(config, communities, store.as_ref(), &mut timer, &mut stats).await;
        }
    }

    Ok(stats)
}

async fn run_continuous<S: TableStore + 'static>(
    config: &Config,
    communities: &[String],
    store: &Arc<S>,
    sources: &Sources,
    shutdown: &StopSignal,
) -> Result<FetchSummary> {
    let mut stats = FetchSummary::default();
    let mut timer = PublishTimer::new(Duration::from_secs(config.publish.interval_secs));

    let mut handles = Vec::new();
    for community in communities {
        for kind in config.enabled_loaders() {
            let loader = match build_loader(config, kind, community, store, sources).await {
                Ok(loader) => loader,
                Err(e) if is_fatal(&e) => {
                    stop_all(handles, config.supervisor.stop_timeout()).await;
                    return Err(e);
                }
                Err(e) => {
                    stats.failures += 1;
                    LoaderLog::named("main", community)
                        .error(format!("cannot start {kind} loader: {e}"));
                    continue;
                }
            };
            LoaderLog::new(loader.kind(), loader.community()).info("started");
            handles.push(LoaderHandle::spawn(loader, RunMode::Continuous));
        }
    }

    loop {
        let all_done = join_all(handles.iter().map(|h| h.wait()));
        let interrupted = tokio::select! {
            _ = shutdown.stopped() => true,
            _ = all_done => break,
            _ = tokio::time::sleep(PUBLISH_POLL), if timer.is_enabled() => false,
        };
        if interrupted {
            stop_all(handles, config.supervisor.stop_timeout()).await;
            return Err(AppError::Interrupted);
        }
        if timer.is_due() {
            publish(config, communities, store.as_ref(), &mut timer, &mut stats).await;
        }
    }

    // Every loader ended on its own, which only happens after errors.
    for handle in handles {
        let log = LoaderLog::new(handle.kind(), handle.community());
        stats.runs += 1;
        if let Err(e) = handle.join().await {
            stats.failures += 1;
            log.error(format!("loader error {e}"));
        }
    }
    Ok(stats)
}

/// Stop `handles`, aborting the ones still running after `timeout`.
pub async fn stop_all(handles: Vec<LoaderHandle>, timeout: Duration) {
    let stopped = join_all(handles.iter().map(|h| h.stop(timeout))).await;

    for (handle, stopped) in handles.into_iter().zip(stopped) {
        let log = LoaderLog::new(handle.kind(), handle.community());
        if !stopped {
            log.warn(format!(
                "still running after {} seconds, aborting",
                timeout.as_secs()
            ));
            handle.abort();
        }
        match handle.join().await {
            Ok(()) => log.info("stopped"),
            Err(e) if e.is_interrupted() => log.info("stopped"),
            Err(e) => log.error(format!("loader error {e}")),
        }
    }
}

/// Export errors are logged and never end the supervisor.
async fn publish<S: TableStore>(
    config: &Config,
    communities: &[String],
    store: &S,
    timer: &mut PublishTimer,
    stats: &mut FetchSummary,
) {
    let communities: Vec<String> = communities.iter().map(|c| normalize_community(c)).collect();
    banner("EXPORTING");
    match run_export(config, &communities, store).await {
        Ok(export) => {
            stats.exports += 1;
            log::info!(
                "exported {} rows in {} resources to {}",
                export.rows,
                export.resources,
                export.package.display()
            );
        }
        Err(e) => log::error!("publish error {e}"),
    }
    timer.reset();
}
