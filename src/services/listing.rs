// src/services/listing.rs

//! Public HTML listing pages.
//!
//! A listing shows a community's submissions or comments newest first, 25 to
//! a page, with a `rel="next"` link to the following (older) page.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{DELETED_AUTHOR, HttpConfig, RecordType, normalize_community};
use crate::services::{ListingItem, ListingPage, ListingSource};
use crate::utils::from_millis;
use crate::utils::http::{create_client, fetch_page};

const ITEM_SELECTOR: &str = "[data-fullname]";
const NEXT_SELECTOR: &str = "a[rel~=\"next\"][href]";

static PERMALINK_PARENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/comments/([0-9a-z]+)/").expect("static regex"));

/// First page of a community listing for `record_type`.
pub fn listing_url(base_url: &str, community: &str, record_type: RecordType) -> String {
    format!(
        "{}/r/{}/{}/",
        base_url.trim_end_matches('/'),
        normalize_community(community),
        record_type.listing_path()
    )
}

/// HTTP implementation of [`ListingSource`].
pub struct HtmlListing {
    client: reqwest::Client,
}

impl HtmlListing {
    pub fn new(http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: create_client(http)?,
        })
    }
}

#[async_trait]
impl ListingSource for HtmlListing {
    async fn fetch_page(&self, url: &str, record_type: RecordType) -> Result<ListingPage> {
        let page_url = Url::parse(url)?;
        let document = fetch_page(&self.client, url).await?;
        parse_listing(&document, &page_url, record_type)
    }
}

fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
}

/// Community a listing URL belongs to (`/r/{community}/...`).
fn listing_community(page_url: &Url) -> Option<String> {
    let mut segments = page_url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "r" {
            return segments
                .next()
                .map(normalize_community)
                .filter(|c| !c.is_empty());
        }
    }
    None
}

/// Extract the items of `record_type` and the next-page link from a listing.
///
/// Skipped: items of other types (the parent post on comment pages),
/// promoted links, and items whose `data-subreddit` names a community other
/// than the one in `page_url`. A kept item without a usable timestamp is a
/// parse error.
pub fn parse_listing(document: &Html, page_url: &Url, record_type: RecordType) -> Result<ListingPage> {
    let item_sel = parse_selector(ITEM_SELECTOR)?;
    let next_sel = parse_selector(NEXT_SELECTOR)?;
    let community = listing_community(page_url);

    let mut items = Vec::new();
    for element in document.select(&item_sel) {
        let attrs = element.value();
        let Some(fullname) = attrs.attr("data-fullname") else {
            continue;
        };
        let Some((kind, id)) = RecordType::parse_fullname(fullname.trim()) else {
            continue;
        };
        if kind != record_type || attrs.classes().any(|c| c == "promoted") {
            continue;
        }
        let foreign = match (attrs.attr("data-subreddit"), &community) {
            (Some(sub), Some(community)) => normalize_community(sub) != *community,
            _ => false,
        };
        if foreign {
            continue;
        }

        let created = attrs
            .attr("data-timestamp")
            .and_then(|ts| ts.trim().parse::<i64>().ok())
            .and_then(from_millis)
            .ok_or_else(|| AppError::parse(page_url.as_str(), format!("{fullname} has no valid data-timestamp")))?;

        let author = attrs
            .attr("data-author")
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(DELETED_AUTHOR)
            .to_string();

        let parent = match record_type {
            RecordType::Comment => attrs
                .attr("data-permalink")
                .and_then(|link| PERMALINK_PARENT.captures(link))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()),
            RecordType::Submission => None,
        };

        items.push(ListingItem {
            id: id.to_string(),
            author,
            created,
            parent,
        });
    }

    let next = document
        .select(&next_sel)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(|href| crate::utils::resolve_url(page_url, href));

    Ok(ListingPage { items, next })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBMISSIONS: &str = r#"
        <html><body>
        <div class="thing promoted" data-fullname="t3_ad1" data-subreddit="u_brand" data-timestamp="1609459999000"></div>
        <div class="thing link" data-fullname="t3_abc" data-author="alice" data-subreddit="Stocks" data-timestamp="1609459300000"></div>
        <div class="thing link" data-fullname="t3_xpost" data-author="carol" data-subreddit="investing" data-timestamp="1609459250000"></div>
        <div class="thing link" data-fullname="t3_def" data-author="" data-timestamp="1609459200500"></div>
        <div class="thing comment" data-fullname="t1_xyz" data-timestamp="1609459100000"></div>
        <span class="next-button"><a href="?count=25&amp;after=t3_def" rel="nofollow next">next</a></span>
        </body></html>
    "#;

    fn page() -> Url {
        Url::parse("https://old.reddit.com/r/stocks/new/").unwrap()
    }

    #[test]
    fn test_listing_url() {
        assert_eq!(
            listing_url("https://old.reddit.com/", "r/Stocks", RecordType::Comment),
            "https://old.reddit.com/r/stocks/comments/"
        );
    }

    #[test]
    fn test_parse_submission_listing() {
        let document = Html::parse_document(SUBMISSIONS);
        let listing = parse_listing(&document, &page(), RecordType::Submission).unwrap();

        let ids: Vec<&str> = listing.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["abc", "def"]);
        assert_eq!(listing.items[0].author, "alice");
        assert_eq!(listing.items[0].created.timestamp(), 1_609_459_300);
        assert_eq!(listing.items[1].author, DELETED_AUTHOR);
        assert_eq!(
            listing.next.as_deref(),
            Some("https://old.reddit.com/r/stocks/new/?count=25&after=t3_def")
        );
    }

    #[test]
    fn test_parse_comment_listing_parent() {
        let html = r#"
            <div data-fullname="t3_post" data-timestamp="1609459000000"></div>
            <div data-fullname="t1_c1" data-author="bob" data-timestamp="1609459100000"
                 data-permalink="/r/stocks/comments/post/some_title/c1/"></div>
        "#;
        let document = Html::parse_document(html);
        let listing = parse_listing(&document, &page(), RecordType::Comment).unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].parent.as_deref(), Some("post"));
        assert!(listing.next.is_none());
    }

    #[test]
    fn test_promoted_link_without_timestamp_is_skipped() {
        let html = r#"
            <div class="thing promoted link" data-fullname="t3_ad"></div>
            <div class="thing link" data-fullname="t3_abc" data-timestamp="1609459300000"></div>
        "#;
        let document = Html::parse_document(html);
        let listing = parse_listing(&document, &page(), RecordType::Submission).unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].id, "abc");
    }

    #[test]
    fn test_listing_community_from_url() {
        assert_eq!(listing_community(&page()).as_deref(), Some("stocks"));
        let front = Url::parse("https://old.reddit.com/new/").unwrap();
        assert_eq!(listing_community(&front), None);
    }

    #[test]
    fn test_missing_timestamp_is_parse_error() {
        let document = Html::parse_document(r#"<div data-fullname="t3_abc"></div>"#);
        let result = parse_listing(&document, &page(), RecordType::Submission);
        assert!(matches!(result, Err(AppError::Parse { .. })));
    }
}
