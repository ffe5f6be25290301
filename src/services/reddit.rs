// src/services/reddit.rs

//! Authenticated Reddit API client.
//!
//! Uses the application-only OAuth flow (`client_credentials`) and serves
//! both the search and the content capability.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::{DELETED_AUTHOR, HttpConfig, RecordType, Submission};
use crate::services::{ContentSource, SearchHit, SearchPage, SearchSource};
use crate::utils::http::{create_client, ensure_success};
use crate::utils::{from_secs_f64, now_secs};

const CLIENT_ID_VAR: &str = "REDDIT_CLIENT_ID";
const CLIENT_SECRET_VAR: &str = "REDDIT_CLIENT_SECRET";
const USER_AGENT_VAR: &str = "REDDIT_USER_AGENT";

/// Results per search page; the API maximum.
const SEARCH_LIMIT: &str = "100";

/// Tokens are refreshed this long before they expire.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

/// OAuth application credentials.
#[derive(Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Overrides `http.user_agent` when set
    pub user_agent: Option<String>,
}

impl std::fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl RedditCredentials {
    /// Read credentials from `REDDIT_CLIENT_ID`, `REDDIT_CLIENT_SECRET` and
    /// the optional `REDDIT_USER_AGENT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::config(format!("environment variable {name} is not set")))
        };
        Ok(Self {
            client_id: required(CLIENT_ID_VAR)?,
            client_secret: required(CLIENT_SECRET_VAR)?,
            user_agent: lookup(USER_AGENT_VAR).filter(|v| !v.trim().is_empty()),
        })
    }
}

#[derive(Debug)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

/// Reddit API client implementing [`SearchSource`] and [`ContentSource`].
pub struct RedditApi {
    client: reqwest::Client,
    api_base_url: String,
    auth_url: String,
    credentials: RedditCredentials,
    token: Mutex<Option<AccessToken>>,
}

impl RedditApi {
    pub fn new(http: &HttpConfig, credentials: RedditCredentials) -> Result<Self> {
        let mut http = http.clone();
        if let Some(user_agent) = &credentials.user_agent {
            http.user_agent = user_agent.clone();
        }
        Ok(Self {
            client: create_client(&http)?,
            api_base_url: http.api_base_url.trim_end_matches('/').to_string(),
            auth_url: http.auth_url,
            credentials,
            token: Mutex::new(None),
        })
    }

    /// Build a client from environment credentials.
    pub fn from_env(http: &HttpConfig) -> Result<Self> {
        Self::new(http, RedditCredentials::from_env()?)
    }

    async fn access_token(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if let Some(current) = token.as_ref() {
            if current.expires_at > Instant::now() + TOKEN_MARGIN {
                return Ok(current.value.clone());
            }
        }

        log::debug!("requesting access token from {}", self.auth_url);
        let response = self
            .client
            .post(&self.auth_url)
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let body = ensure_success(&self.auth_url, response).await?.text().await?;
        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AppError::parse(&self.auth_url, e))?;

        let value = parsed.access_token.clone();
        *token = Some(AccessToken {
            value: parsed.access_token,
            expires_at: Instant::now() + Duration::from_secs(parsed.expires_in),
        });
        Ok(value)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}{}", self.api_base_url, path);
        let token = self.access_token().await?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.token.lock().await.take();
        }
        let body = ensure_success(path, response).await?.text().await?;
        serde_json::from_str(&body).map_err(|e| AppError::parse(path, e))
    }
}

#[async_trait]
impl SearchSource for RedditApi {
    async fn search(
        &self,
        query: &str,
        record_type: RecordType,
        after: Option<&str>,
    ) -> Result<SearchPage> {
        if record_type != RecordType::Submission {
            return Err(AppError::Unsupported {
                loader: "search".into(),
                record_type: record_type.to_string(),
            });
        }

        let mut params = vec![
            ("q", query),
            ("sort", "new"),
            ("type", "link"),
            ("limit", SEARCH_LIMIT),
            ("raw_json", "1"),
        ];
        if let Some(after) = after {
            params.push(("after", after));
        }

        let listing: Listing<ApiSubmission> = self.get_json("/r/all/search", &params).await?;
        search_page(listing)
    }
}

#[async_trait]
impl ContentSource for RedditApi {
    async fn fetch(&self, fullnames: &[String]) -> Result<Vec<Submission>> {
        if fullnames.is_empty() {
            return Ok(Vec::new());
        }
        let ids = fullnames.join(",");
        let listing: Listing<ApiSubmission> = self
            .get_json("/api/info", &[("id", ids.as_str()), ("raw_json", "1")])
            .await?;
        submissions(listing, now_secs())
    }
}

// ----------------------------------------------------------------------------
// Wire format
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Listing<T> {
    data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    #[serde(default)]
    after: Option<String>,
    #[serde(default = "Vec::new")]
    children: Vec<Thing<T>>,
}

#[derive(Debug, Deserialize)]
struct Thing<T> {
    kind: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct ApiSubmission {
    id: String,
    subreddit: String,
    #[serde(default)]
    author: Option<String>,
    created_utc: f64,
    /// `false` or a timestamp
    #[serde(default)]
    edited: serde_json::Value,
    #[serde(default)]
    pinned: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    removed_by_category: Option<String>,
    #[serde(default)]
    is_self: bool,
    #[serde(default)]
    is_video: bool,
    #[serde(default)]
    is_original_content: bool,
    #[serde(default)]
    title: String,
    #[serde(default)]
    link_flair_text: Option<String>,
    #[serde(default)]
    upvote_ratio: f64,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    gilded: i64,
    #[serde(default)]
    total_awards_received: i64,
    #[serde(default)]
    num_comments: i64,
    #[serde(default)]
    num_crossposts: i64,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    thumbnail: Option<String>,
}

impl ApiSubmission {
    fn created(&self) -> Result<DateTime<Utc>> {
        from_secs_f64(self.created_utc).ok_or_else(|| {
            AppError::parse(
                format!("t3_{}", self.id),
                format!("invalid created_utc {}", self.created_utc),
            )
        })
    }

    fn author(&self) -> String {
        self.author
            .clone()
            .unwrap_or_else(|| DELETED_AUTHOR.to_string())
    }

    /// Removal flags are refined by the content loader's marker policy.
    fn into_submission(self, retrieved: DateTime<Utc>) -> Result<Submission> {
        let created = self.created()?;
        let author = self.author();
        let edited = self.edited.as_f64().and_then(from_secs_f64);
        let shortlink = format!("https://redd.it/{}", self.id);

        Ok(Submission {
            community: self.subreddit.to_lowercase(),
            author,
            created,
            retrieved: retrieved.max(created),
            edited,
            pinned: self.pinned,
            archived: self.archived,
            locked: self.locked,
            removed: self.removed_by_category.is_some(),
            deleted: false,
            is_self: self.is_self,
            is_video: self.is_video,
            is_original_content: self.is_original_content,
            title: self.title,
            link_flair_text: self.link_flair_text,
            upvote_ratio: self.upvote_ratio,
            score: self.score,
            gilded: self.gilded,
            total_awards_received: self.total_awards_received,
            num_comments: self.num_comments,
            num_crossposts: self.num_crossposts,
            selftext: self.selftext,
            thumbnail: self.thumbnail.filter(|t| !t.is_empty()),
            shortlink,
            id: self.id,
        })
    }
}

fn search_page(listing: Listing<ApiSubmission>) -> Result<SearchPage> {
    let hits = listing
        .data
        .children
        .into_iter()
        .filter(|thing| thing.kind == RecordType::Submission.prefix())
        .map(|thing| {
            let post = thing.data;
            Ok(SearchHit {
                created: post.created()?,
                author: post.author(),
                community: post.subreddit.to_lowercase(),
                id: post.id,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SearchPage {
        hits,
        after: listing.data.after,
    })
}

fn submissions(listing: Listing<ApiSubmission>, retrieved: DateTime<Utc>) -> Result<Vec<Submission>> {
    listing
        .data
        .children
        .into_iter()
        .filter(|thing| thing.kind == RecordType::Submission.prefix())
        .map(|thing| thing.data.into_submission(retrieved))
        .collect()
}
