// src/services/history.rs

//! Archive search client.
//!
//! The archive serves `/reddit/{submission,comment}/search` with
//! `after`/`before` bounds in unix seconds. It needs no credentials.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::{DELETED_AUTHOR, HttpConfig, RecordType, normalize_community};
use crate::services::{HistorySource, ListingItem};
use crate::utils::from_secs_f64;
use crate::utils::http::{create_client, ensure_success};

/// Items per request; the archive maximum.
const PAGE_LIMIT: &str = "100";

/// Archive client implementing [`HistorySource`].
pub struct HistoryApi {
    client: reqwest::Client,
    base_url: String,
}

impl HistoryApi {
    pub fn new(http: &HttpConfig, base_url: &str) -> Result<Self> {
        url::Url::parse(base_url)?;
        Ok(Self {
            client: create_client(http)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HistorySource for HistoryApi {
    async fn search_window(
        &self,
        community: &str,
        record_type: RecordType,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<ListingItem>> {
        let path = format!("/reddit/{}/search", record_type.as_str());
        let url = format!("{}{}", self.base_url, path);
        let after = after.timestamp().to_string();
        let before = before.timestamp().to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("subreddit", community),
                ("sort", "desc"),
                ("limit", PAGE_LIMIT),
                ("after", after.as_str()),
                ("before", before.as_str()),
            ])
            .send()
            .await?;
        let body = ensure_success(&path, response).await?.text().await?;
        let page: ArchivePage = serde_json::from_str(&body).map_err(|e| AppError::parse(&path, e))?;
        window_items(page, community, record_type)
    }
}

// ----------------------------------------------------------------------------
// Wire format
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ArchivePage {
    #[serde(default)]
    data: Vec<ArchiveItem>,
}

#[derive(Debug, Deserialize)]
struct ArchiveItem {
    id: String,
    #[serde(default)]
    subreddit: Option<String>,
    #[serde(default)]
    author: Option<String>,
    created_utc: f64,
    #[serde(default)]
    link_id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
}

impl ArchiveItem {
    /// Submission a comment belongs to, as a bare id.
    fn parent(&self) -> Option<String> {
        [&self.link_id, &self.parent_id]
            .into_iter()
            .flatten()
            .find_map(|fullname| match RecordType::parse_fullname(fullname) {
                Some((RecordType::Submission, id)) => Some(id.to_string()),
                _ => None,
            })
    }
}

/// Items of one archive page, newest first, restricted to `community`.
fn window_items(
    page: ArchivePage,
    community: &str,
    record_type: RecordType,
) -> Result<Vec<ListingItem>> {
    let community = normalize_community(community);
    let mut items = Vec::with_capacity(page.data.len());
    for item in page.data {
        if item
            .subreddit
            .as_deref()
            .is_some_and(|s| normalize_community(s) != community)
        {
            continue;
        }
        let created = from_secs_f64(item.created_utc).ok_or_else(|| {
            AppError::parse(
                record_type.fullname(&item.id),
                format!("invalid created_utc {}", item.created_utc),
            )
        })?;
        let parent = match record_type {
            RecordType::Comment => item.parent(),
            RecordType::Submission => None,
        };
        items.push(ListingItem {
            author: item.author.unwrap_or_else(|| DELETED_AUTHOR.to_string()),
            id: item.id,
            created,
            parent,
        });
    }
    items.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(items)
}
