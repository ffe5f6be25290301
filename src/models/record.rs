// src/models/record.rs

//! Record types, their table schemas, and the row structures stored per
//! collection.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::serde::{ts_seconds, ts_seconds_option};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Author sentinel for accounts that no longer exist.
pub const DELETED_AUTHOR: &str = "[deleted]";

static FULLNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(t[1-6])_([0-9a-z]+)$").expect("static regex"));

/// The closed set of record types a collection can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Submission,
    Comment,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Submission => "submission",
            RecordType::Comment => "comment",
        }
    }

    /// Type prefix the upstream API puts in front of ids.
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordType::Submission => "t3",
            RecordType::Comment => "t1",
        }
    }

    /// Path segment of the community listing that shows this type newest-first.
    pub fn listing_path(&self) -> &'static str {
        match self {
            RecordType::Submission => "new",
            RecordType::Comment => "comments",
        }
    }

    pub fn fullname(&self, id: &str) -> String {
        format!("{}_{}", self.prefix(), id)
    }

    /// Split a fullname such as `t3_abc123` into its record type and bare id.
    pub fn parse_fullname(fullname: &str) -> Option<(RecordType, &str)> {
        let caps = FULLNAME.captures(fullname)?;
        let id = caps.get(2)?.as_str();
        let record_type = match caps.get(1)?.as_str() {
            "t3" => RecordType::Submission,
            "t1" => RecordType::Comment,
            _ => return None,
        };
        Some((record_type, id))
    }

    /// Columns of the discovery tables written by the search and crawler loaders.
    pub fn discovery_schema(&self) -> Schema {
        match self {
            RecordType::Submission => Schema::new(*self, DISCOVERY_SUBMISSION),
            RecordType::Comment => Schema::new(*self, DISCOVERY_COMMENT),
        }
    }

    /// Columns of the canonical table written by the content loader.
    pub fn canonical_schema(&self) -> Schema {
        match self {
            RecordType::Submission => Schema::new(*self, CANONICAL_SUBMISSION),
            RecordType::Comment => Schema::new(*self, DISCOVERY_COMMENT),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "submission" => Ok(RecordType::Submission),
            "comment" => Ok(RecordType::Comment),
            other => Err(AppError::config(format!("unknown record type '{other}'"))),
        }
    }
}

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    String,
    Integer,
    Number,
    Boolean,
    /// Unix seconds
    Datetime,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::String => "string",
            ColumnKind::Integer => "integer",
            ColumnKind::Number => "number",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Datetime => "datetime",
        }
    }

    fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            ColumnKind::String => value.is_string(),
            ColumnKind::Integer | ColumnKind::Datetime => value.is_i64() || value.is_u64(),
            ColumnKind::Number => value.is_number(),
            ColumnKind::Boolean => value.is_boolean(),
        }
    }
}

/// A single column definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub description: &'static str,
}

const fn col(name: &'static str, kind: ColumnKind, description: &'static str) -> Column {
    Column {
        name,
        kind,
        nullable: false,
        description,
    }
}

const fn opt(name: &'static str, kind: ColumnKind, description: &'static str) -> Column {
    Column {
        name,
        kind,
        nullable: true,
        description,
    }
}

const DISCOVERY_SUBMISSION: &[Column] = &[
    col("id", ColumnKind::String, "The id of the submission"),
    col("community", ColumnKind::String, "The community name"),
    col("author", ColumnKind::String, "The author's username"),
    col("created", ColumnKind::Datetime, "Time the submission was created"),
    col("retrieved", ColumnKind::Datetime, "Time the submission was retrieved"),
];

const DISCOVERY_COMMENT: &[Column] = &[
    col("id", ColumnKind::String, "The id of the comment"),
    col("community", ColumnKind::String, "The community name"),
    col("author", ColumnKind::String, "The author's username"),
    col("created", ColumnKind::Datetime, "Time the comment was created"),
    col("retrieved", ColumnKind::Datetime, "Time the comment was retrieved"),
    opt("parent", ColumnKind::String, "The id of the submission the comment belongs to"),
];

const CANONICAL_SUBMISSION: &[Column] = &[
    col("id", ColumnKind::String, "The id of the submission"),
    col("community", ColumnKind::String, "The community name"),
    col("author", ColumnKind::String, "The author's username"),
    col("created", ColumnKind::Datetime, "Time the submission was created"),
    col("retrieved", ColumnKind::Datetime, "Time the submission was retrieved"),
    opt("edited", ColumnKind::Datetime, "Time the submission was modified"),
    col("pinned", ColumnKind::Boolean, "Whether or not the submission is pinned"),
    col("archived", ColumnKind::Boolean, "Whether or not the submission is archived"),
    col("locked", ColumnKind::Boolean, "Whether or not the submission is locked"),
    col("removed", ColumnKind::Boolean, "Whether or not the submission is mod removed"),
    col("deleted", ColumnKind::Boolean, "Whether or not the submission is user deleted"),
    col("is_self", ColumnKind::Boolean, "Whether or not the submission is a text"),
    col("is_video", ColumnKind::Boolean, "Whether or not the submission is a video"),
    col(
        "is_original_content",
        ColumnKind::Boolean,
        "Whether or not the submission has been set as original content",
    ),
    col("title", ColumnKind::String, "The title of the submission"),
    opt("link_flair_text", ColumnKind::String, "The submission link flair text"),
    col(
        "upvote_ratio",
        ColumnKind::Number,
        "The percentage of upvotes from all votes on the submission",
    ),
    col("score", ColumnKind::Integer, "The number of upvotes for the submission"),
    col("gilded", ColumnKind::Integer, "The number of gilded awards on the submission"),
    col(
        "total_awards_received",
        ColumnKind::Integer,
        "The number of awards on the submission",
    ),
    col("num_comments", ColumnKind::Integer, "The number of comments on the submission"),
    col(
        "num_crossposts",
        ColumnKind::Integer,
        "The number of crossposts on the submission",
    ),
    col("selftext", ColumnKind::String, "The submission selftext on text posts"),
    opt("thumbnail", ColumnKind::String, "The submission thumbnail on image posts"),
    col("shortlink", ColumnKind::String, "The submission short url"),
];

/// Ordered column list attached to a record type.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub record_type: RecordType,
    pub columns: &'static [Column],
}

impl Schema {
    fn new(record_type: RecordType, columns: &'static [Column]) -> Self {
        Self {
            record_type,
            columns,
        }
    }

    /// Check that a row type serializes to exactly this schema.
    ///
    /// Every serialized key must be a known column of the right kind, and every
    /// non-nullable column must be present.
    pub fn check<R: Row + Default>(&self) -> Result<()> {
        let value = serde_json::to_value(R::default())?;
        let object = value.as_object().ok_or_else(|| {
            AppError::validation(format!("{} rows must serialize to objects", self.record_type))
        })?;

        let known: BTreeSet<&str> = self.columns.iter().map(|c| c.name).collect();
        if let Some(extra) = object.keys().find(|k| !known.contains(k.as_str())) {
            return Err(AppError::validation(format!(
                "column '{extra}' is not part of the {} schema",
                self.record_type
            )));
        }

        for column in self.columns {
            match object.get(column.name) {
                None | Some(serde_json::Value::Null) if column.nullable => {}
                None => {
                    return Err(AppError::validation(format!(
                        "{} schema column '{}' is missing",
                        self.record_type, column.name
                    )));
                }
                Some(value) if !column.kind.accepts(value) => {
                    return Err(AppError::validation(format!(
                        "{} schema column '{}' expects {}, got {value}",
                        self.record_type,
                        column.name,
                        column.kind.as_str()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// A row that can live in a collection table.
pub trait Row: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn created(&self) -> DateTime<Utc>;
    fn retrieved(&self) -> DateTime<Utc>;
}

/// Sort rows by `(created, retrieved)`, breaking ties by id.
pub fn sort_rows<R: Row>(rows: &mut [R]) {
    rows.sort_by(|a, b| {
        (a.created(), a.retrieved(), a.id()).cmp(&(b.created(), b.retrieved(), b.id()))
    });
}

/// A lightweight sighting produced by the search and crawler loaders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub id: String,
    pub community: String,
    pub author: String,
    #[serde(with = "ts_seconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub retrieved: DateTime<Utc>,
    /// Parent submission id, only set for comments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Row for DiscoveryEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn retrieved(&self) -> DateTime<Utc> {
        self.retrieved
    }
}

/// A fully populated submission as stored in the canonical table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub community: String,
    pub author: String,
    #[serde(with = "ts_seconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    pub retrieved: DateTime<Utc>,
    #[serde(default, with = "ts_seconds_option")]
    pub edited: Option<DateTime<Utc>>,

    pub pinned: bool,
    pub archived: bool,
    pub locked: bool,
    pub removed: bool,
    pub deleted: bool,
    pub is_self: bool,
    pub is_video: bool,
    pub is_original_content: bool,

    pub title: String,
    #[serde(default)]
    pub link_flair_text: Option<String>,
    pub upvote_ratio: f64,
    pub score: i64,
    pub gilded: i64,
    pub total_awards_received: i64,
    pub num_comments: i64,
    pub num_crossposts: i64,
    pub selftext: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    pub shortlink: String,
}

impl Submission {
    /// Overwrite this row with a freshly fetched one.
    ///
    /// Every field comes from `fetched`, except optional fields the fetch left
    /// empty, which keep their current value.
    pub fn update_from(&mut self, fetched: &Submission) {
        let edited = fetched.edited.or(self.edited);
        let link_flair_text = fetched
            .link_flair_text
            .clone()
            .or_else(|| self.link_flair_text.take());
        let thumbnail = fetched.thumbnail.clone().or_else(|| self.thumbnail.take());

        *self = Submission {
            edited,
            link_flair_text,
            thumbnail,
            ..fetched.clone()
        };
    }
}

impl Row for Submission {
    fn id(&self) -> &str {
        &self.id
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn retrieved(&self) -> DateTime<Utc> {
        self.retrieved
    }
}
