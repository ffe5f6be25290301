//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{LoaderKind, RecordType};

/// Root application configuration.
///
/// A loader section being present enables that loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Communities harvested by the supervisor, in order
    #[serde(default)]
    pub communities: Vec<String>,

    /// HTTP client settings shared by every source
    #[serde(default)]
    pub http: HttpConfig,

    /// Collection store settings
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub search: Option<SearchConfig>,

    #[serde(default)]
    pub crawler: Option<CrawlerConfig>,

    #[serde(default)]
    pub backfill: Option<BackfillConfig>,

    #[serde(default)]
    pub content: Option<ContentConfig>,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub publish: PublishConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.communities.iter().any(|c| c.trim().is_empty()) {
            return Err(AppError::validation("communities contains an empty name"));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::validation("http.timeout_secs must be > 0"));
        }
        if self.enabled_loaders().is_empty() {
            return Err(AppError::validation(
                "at least one of [search], [crawler], [backfill] or [content] must be configured",
            ));
        }
        if let Some(search) = &self.search {
            search.validate()?;
        }
        if let Some(crawler) = &self.crawler {
            crawler.validate()?;
        }
        if let Some(backfill) = &self.backfill {
            backfill.validate()?;
        }
        if let Some(content) = &self.content {
            content.validate()?;
        }
        if self.supervisor.stop_timeout_secs == 0 {
            return Err(AppError::validation(
                "supervisor.stop_timeout_secs must be > 0",
            ));
        }
        Ok(())
    }

    /// Loader kinds enabled by this configuration.
    pub fn enabled_loaders(&self) -> Vec<LoaderKind> {
        let mut kinds = Vec::new();
        if self.search.is_some() {
            kinds.push(LoaderKind::Search);
        }
        if self.crawler.is_some() {
            kinds.push(LoaderKind::Crawler);
        }
        if self.backfill.is_some() {
            kinds.push(LoaderKind::Backfill);
        }
        if self.content.is_some() {
            kinds.push(LoaderKind::Content);
        }
        kinds
    }

    /// Record types a loader writes, or nothing when it is disabled.
    pub fn record_types(&self, loader: LoaderKind) -> Vec<RecordType> {
        match loader {
            LoaderKind::Search => self.search.as_ref().map(|s| s.record_types.clone()),
            LoaderKind::Crawler => self.crawler.as_ref().map(|s| s.record_types.clone()),
            LoaderKind::Backfill => self.backfill.as_ref().map(|s| s.record_types.clone()),
            LoaderKind::Content => self.content.as_ref().map(|s| s.record_types.clone()),
        }
        .unwrap_or_default()
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Base URL of the authenticated API
    #[serde(default = "defaults::api_base_url")]
    pub api_base_url: String,

    /// OAuth token endpoint
    #[serde(default = "defaults::auth_url")]
    pub auth_url: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            api_base_url: defaults::api_base_url(),
            auth_url: defaults::auth_url(),
        }
    }
}

/// Collection store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of all collections
    #[serde(default = "defaults::store_root")]
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: defaults::store_root(),
        }
    }
}

/// Search loader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "defaults::submission_only")]
    pub record_types: Vec<RecordType>,

    /// Initial `last_run` in unix seconds, used until a watermark is persisted
    pub start_time: i64,

    /// Pause between passes in continuous mode
    #[serde(default = "defaults::search_idle_period")]
    pub idle_period_secs: u64,

    /// Pause after a failed search request
    #[serde(default = "defaults::search_backoff")]
    pub backoff_secs: u64,

    /// Result pages followed per query
    #[serde(default = "defaults::search_max_pages")]
    pub max_pages: usize,

    /// Keep a dated copy of every table write
    #[serde(default)]
    pub snapshot: bool,
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        LoaderKind::Search.check_supported(&self.record_types)?;
        if self.max_pages == 0 {
            return Err(AppError::validation("search.max_pages must be > 0"));
        }
        start_time(self.start_time, "search.start_time").map(|_| ())
    }

    pub fn start(&self) -> Result<DateTime<Utc>> {
        start_time(self.start_time, "search.start_time")
    }

    pub fn idle_period(&self) -> Duration {
        Duration::from_secs(self.idle_period_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

/// Listing crawler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "defaults::submission_only")]
    pub record_types: Vec<RecordType>,

    /// Initial `last_run` in unix seconds, used until a watermark is persisted
    pub start_time: i64,

    /// Listing host, e.g. `https://old.reddit.com`
    #[serde(default = "defaults::listing_base_url")]
    pub base_url: String,

    #[serde(default = "defaults::crawler_idle_period")]
    pub idle_period_secs: u64,

    /// Delay after every page fetch
    #[serde(default = "defaults::page_delay")]
    pub page_delay_ms: u64,

    /// Pause after a failed page before the sweep is abandoned
    #[serde(default = "defaults::error_backoff")]
    pub error_backoff_secs: u64,

    /// Upper bound on pages per sweep
    #[serde(default = "defaults::crawler_max_pages")]
    pub max_pages: usize,

    #[serde(default)]
    pub snapshot: bool,
}

impl CrawlerConfig {
    pub fn validate(&self) -> Result<()> {
        LoaderKind::Crawler.check_supported(&self.record_types)?;
        if self.max_pages == 0 {
            return Err(AppError::validation("crawler.max_pages must be > 0"));
        }
        url::Url::parse(&self.base_url)?;
        start_time(self.start_time, "crawler.start_time").map(|_| ())
    }

    pub fn start(&self) -> Result<DateTime<Utc>> {
        start_time(self.start_time, "crawler.start_time")
    }

    pub fn idle_period(&self) -> Duration {
        Duration::from_secs(self.idle_period_secs)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

/// Archive backfill settings.
///
/// The loader walks the archive's time-bounded search backwards from the
/// present down to `start_time`, then keeps covering the newest window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default = "defaults::submission_only")]
    pub record_types: Vec<RecordType>,

    /// Oldest time of interest in unix seconds
    pub start_time: i64,

    /// Base URL of the archive search API
    #[serde(default = "defaults::archive_base_url")]
    pub base_url: String,

    #[serde(default = "defaults::backfill_idle_period")]
    pub idle_period_secs: u64,

    /// Delay between archive requests
    #[serde(default = "defaults::page_delay")]
    pub page_delay_ms: u64,

    #[serde(default = "defaults::error_backoff")]
    pub error_backoff_secs: u64,

    /// Archive pages fetched per pass before the window is left for the next one
    #[serde(default = "defaults::backfill_max_pages")]
    pub max_pages: usize,

    #[serde(default)]
    pub snapshot: bool,
}

impl BackfillConfig {
    pub fn validate(&self) -> Result<()> {
        LoaderKind::Backfill.check_supported(&self.record_types)?;
        if self.max_pages == 0 {
            return Err(AppError::validation("backfill.max_pages must be > 0"));
        }
        url::Url::parse(&self.base_url)?;
        start_time(self.start_time, "backfill.start_time").map(|_| ())
    }

    pub fn start(&self) -> Result<DateTime<Utc>> {
        start_time(self.start_time, "backfill.start_time")
    }

    pub fn idle_period(&self) -> Duration {
        Duration::from_secs(self.idle_period_secs)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

/// A discovery collection the content loader reconciles from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub loader: LoaderKind,

    /// Defaults to the community being reconciled
    #[serde(default)]
    pub community: Option<String>,
}

/// Content (reconciliation) loader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "defaults::submission_only")]
    pub record_types: Vec<RecordType>,

    #[serde(default = "defaults::content_idle_period")]
    pub idle_period_secs: u64,

    /// Trailing window of discovery time that is refetched every pass
    #[serde(default = "defaults::recheck_window")]
    pub recheck_window_hours: u64,

    /// Ids per content request (the API accepts at most 100)
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Delay between content requests
    #[serde(default = "defaults::page_delay")]
    pub batch_delay_ms: u64,

    /// Consecutive failures after which a record type's pass is abandoned
    #[serde(default = "defaults::max_consecutive_errors")]
    pub max_consecutive_errors: usize,

    #[serde(default = "defaults::error_backoff")]
    pub error_backoff_secs: u64,

    #[serde(default = "defaults::upstreams")]
    pub upstreams: Vec<UpstreamConfig>,

    /// Body texts that mark a record as removed by moderators
    #[serde(default = "defaults::removed_markers")]
    pub removed_markers: Vec<String>,

    /// Body texts that mark a record as deleted by its author
    #[serde(default = "defaults::deleted_markers")]
    pub deleted_markers: Vec<String>,

    #[serde(default)]
    pub snapshot: bool,
}

impl ContentConfig {
    pub fn validate(&self) -> Result<()> {
        LoaderKind::Content.check_supported(&self.record_types)?;
        if self.batch_size == 0 || self.batch_size > defaults::batch_size() {
            return Err(AppError::validation(format!(
                "content.batch_size must be between 1 and {}",
                defaults::batch_size()
            )));
        }
        if self.recheck_window_hours > defaults::MAX_RECHECK_WINDOW_HOURS {
            return Err(AppError::validation(format!(
                "content.recheck_window_hours must be <= {}",
                defaults::MAX_RECHECK_WINDOW_HOURS
            )));
        }
        if self.max_consecutive_errors == 0 {
            return Err(AppError::validation(
                "content.max_consecutive_errors must be > 0",
            ));
        }
        if self.upstreams.is_empty() {
            return Err(AppError::validation("content.upstreams must not be empty"));
        }
        if let Some(upstream) = self
            .upstreams
            .iter()
            .find(|u| u.loader == LoaderKind::Content)
        {
            return Err(AppError::validation(format!(
                "content cannot reconcile from another content collection ({:?})",
                upstream.community
            )));
        }
        Ok(())
    }

    pub fn idle_period(&self) -> Duration {
        Duration::from_secs(self.idle_period_secs)
    }

    pub fn recheck_window(&self) -> chrono::Duration {
        i64::try_from(self.recheck_window_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

/// How loaders are driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// One pass per loader, then return
    #[default]
    Once,
    /// Passes separated by the idle period until stopped
    Continuous,
}

/// Process-level supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub mode: RunMode,

    /// Pause after each community in `once` mode
    #[serde(default)]
    pub pause_secs: u64,

    /// How long `stop` waits for a loader before it is aborted
    #[serde(default = "defaults::stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Rounds over all communities in `once` mode; 0 repeats until shutdown
    #[serde(default = "defaults::rounds")]
    pub rounds: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            pause_secs: 0,
            stop_timeout_secs: defaults::stop_timeout(),
            rounds: defaults::rounds(),
        }
    }
}

impl SupervisorConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Export step settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Minimum seconds between exports; 0 disables the step
    #[serde(default)]
    pub interval_secs: u64,

    #[serde(default = "defaults::export_dir")]
    pub export_dir: PathBuf,

    /// Dataset title written to the package descriptor
    #[serde(default = "defaults::dataset_title")]
    pub title: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            export_dir: defaults::export_dir(),
            title: defaults::dataset_title(),
        }
    }
}

fn start_time(secs: i64, field: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| AppError::config(format!("{field} is not a valid unix timestamp")))
}

mod defaults {
    use std::path::PathBuf;

    use super::UpstreamConfig;
    use crate::models::{LoaderKind, RecordType};

    // HTTP defaults
    pub fn user_agent() -> String {
        concat!("rust:harvester:v", env!("CARGO_PKG_VERSION")).into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn api_base_url() -> String {
        "https://oauth.reddit.com".into()
    }
    pub fn auth_url() -> String {
        "https://www.reddit.com/api/v1/access_token".into()
    }

    // Store defaults
    pub fn store_root() -> PathBuf {
        PathBuf::from("data/store")
    }

    // Loader defaults
    pub fn submission_only() -> Vec<RecordType> {
        vec![RecordType::Submission]
    }
    pub fn search_idle_period() -> u64 {
        600
    }
    pub fn search_backoff() -> u64 {
        10
    }
    pub fn search_max_pages() -> usize {
        10
    }
    pub fn listing_base_url() -> String {
        "https://old.reddit.com".into()
    }
    pub fn crawler_idle_period() -> u64 {
        60
    }
    pub fn page_delay() -> u64 {
        350
    }
    pub fn error_backoff() -> u64 {
        1
    }
    pub fn crawler_max_pages() -> usize {
        40
    }
    pub fn archive_base_url() -> String {
        "https://api.pushshift.io".into()
    }
    pub fn backfill_idle_period() -> u64 {
        3600
    }
    pub fn backfill_max_pages() -> usize {
        100
    }
    pub fn content_idle_period() -> u64 {
        300
    }
    pub fn recheck_window() -> u64 {
        8
    }
    /// Ten years
    pub const MAX_RECHECK_WINDOW_HOURS: u64 = 87_600;
    pub fn batch_size() -> usize {
        100
    }
    pub fn max_consecutive_errors() -> usize {
        12
    }
    pub fn upstreams() -> Vec<UpstreamConfig> {
        vec![
            UpstreamConfig {
                loader: LoaderKind::Search,
                community: None,
            },
            UpstreamConfig {
                loader: LoaderKind::Crawler,
                community: None,
            },
        ]
    }
    pub fn removed_markers() -> Vec<String> {
        vec!["[removed]".into()]
    }
    pub fn deleted_markers() -> Vec<String> {
        vec!["[deleted]".into()]
    }

    // Supervisor defaults
    pub fn stop_timeout() -> u64 {
        5
    }
    pub fn rounds() -> usize {
        1
    }

    // Publish defaults
    pub fn export_dir() -> PathBuf {
        PathBuf::from("data/export")
    }
    pub fn dataset_title() -> String {
        "Community submissions".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        communities = ["wallstreetbets"]

        [search]
        start_time = 1609459200

        [crawler]
        record_types = ["submission", "comment"]
        start_time = 1609459200
        page_delay_ms = 500

        [content]
        recheck_window_hours = 12
        upstreams = [{ loader = "crawler" }, { loader = "search", community = "stocks" }]
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(
            config.enabled_loaders(),
            vec![LoaderKind::Search, LoaderKind::Crawler, LoaderKind::Content]
        );
        let crawler = config.crawler.as_ref().unwrap();
        assert_eq!(crawler.page_delay(), Duration::from_millis(500));
        assert_eq!(crawler.base_url, "https://old.reddit.com");

        let content = config.content.as_ref().unwrap();
        assert_eq!(content.recheck_window(), chrono::Duration::hours(12));
        assert_eq!(content.batch_size, 100);
        assert_eq!(content.max_consecutive_errors, 12);
        assert_eq!(content.upstreams[1].community.as_deref(), Some("stocks"));
        assert_eq!(config.supervisor.mode, RunMode::Once);
    }

    #[test]
    fn test_missing_start_time_is_fatal() {
        let result: std::result::Result<Config, _> = toml::from_str("[search]\nidle_period_secs = 5\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unsupported_record_type_rejected() {
        let config: Config =
            toml::from_str("[search]\nstart_time = 0\nrecord_types = [\"comment\"]\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(AppError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_backfill_section() {
        let config: Config = toml::from_str(
            "[backfill]\nstart_time = 1609459200\nrecord_types = [\"submission\", \"comment\"]\n",
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.enabled_loaders(), vec![LoaderKind::Backfill]);
        assert_eq!(
            config.record_types(LoaderKind::Backfill),
            vec![RecordType::Submission, RecordType::Comment]
        );
        let backfill = config.backfill.as_ref().unwrap();
        assert_eq!(backfill.base_url, "https://api.pushshift.io");
        assert_eq!(backfill.page_delay(), Duration::from_millis(350));

        let config: Config =
            toml::from_str("[backfill]\nstart_time = 0\nmax_pages = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_no_loader_is_invalid() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_batch_size_bounds() {
        let config: Config = toml::from_str("[content]\nbatch_size = 250\n").unwrap();
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_recheck_window_bounds() {
        let config: Config =
            toml::from_str("[content]\nrecheck_window_hours = 3000000000\n").unwrap();
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
        let content = config.content.as_ref().unwrap();
        assert_eq!(content.recheck_window(), chrono::Duration::MAX);

        let config: Config = toml::from_str("[content]\nrecheck_window_hours = 87600\n").unwrap();
        config.validate().unwrap();
    }
}
