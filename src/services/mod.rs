//! Upstream sources the loaders pull from.
//!
//! Each capability is a trait so loaders can be driven by scripted sources in
//! tests:
//! - `SearchSource`: full-text search, one result page at a time
//! - `ListingSource`: one page of a newest-first community listing
//! - `ContentSource`: full records for a batch of fullnames
//! - `HistorySource`: archived items inside a time window
//!
//! `RedditApi` implements search and content, `HtmlListing` the listing and
//! `HistoryApi` the archive.

mod history;
mod listing;
mod reddit;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{RecordType, Submission};

pub use history::HistoryApi;
pub use listing::{HtmlListing, listing_url, parse_listing};
pub use reddit::{RedditApi, RedditCredentials};

/// A single search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub id: String,
    /// Community the hit was posted in, lowercased
    pub community: String,
    pub author: String,
    pub created: DateTime<Utc>,
}

/// One page of search results plus the cursor of the next page.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub after: Option<String>,
}

/// A single listing item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingItem {
    pub id: String,
    pub author: String,
    pub created: DateTime<Utc>,
    /// Parent submission id, comments only
    pub parent: Option<String>,
}

/// One parsed listing page.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    /// Items in page order (newest first)
    pub items: Vec<ListingItem>,
    /// Absolute URL of the next (older) page
    pub next: Option<String>,
}

#[async_trait]
pub trait SearchSource: Send + Sync {
    /// Fetch one page of results for `query`, newest first.
    async fn search(
        &self,
        query: &str,
        record_type: RecordType,
        after: Option<&str>,
    ) -> Result<SearchPage>;
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Fetch and parse the listing page at `url`.
    async fn fetch_page(&self, url: &str, record_type: RecordType) -> Result<ListingPage>;
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetch full records for up to 100 fullnames.
    ///
    /// Unknown or inaccessible ids are silently missing from the result.
    async fn fetch(&self, fullnames: &[String]) -> Result<Vec<Submission>>;
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch up to one page of items posted in `community` with
    /// `after < created < before`, newest first.
    async fn search_window(
        &self,
        community: &str,
        record_type: RecordType,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<ListingItem>>;
}
