// src/models/collection.rs

//! Collection addressing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::RecordType;

/// The loader that owns (writes) a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderKind {
    Search,
    Crawler,
    Backfill,
    Content,
}

impl LoaderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderKind::Search => "search",
            LoaderKind::Crawler => "crawler",
            LoaderKind::Backfill => "backfill",
            LoaderKind::Content => "content",
        }
    }

    /// Record types this loader knows how to fetch.
    pub fn supports(&self, record_type: RecordType) -> bool {
        match self {
            LoaderKind::Search | LoaderKind::Content => record_type == RecordType::Submission,
            LoaderKind::Crawler | LoaderKind::Backfill => true,
        }
    }

    /// Fail with a configuration error on the first unsupported record type.
    pub fn check_supported(&self, record_types: &[RecordType]) -> Result<()> {
        if record_types.is_empty() {
            return Err(AppError::config(format!(
                "{}.record_types must not be empty",
                self.as_str()
            )));
        }
        match record_types.iter().find(|t| !self.supports(**t)) {
            Some(unsupported) => Err(AppError::Unsupported {
                loader: self.as_str().to_string(),
                record_type: unsupported.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoaderKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "search" => Ok(LoaderKind::Search),
            "crawler" => Ok(LoaderKind::Crawler),
            "backfill" => Ok(LoaderKind::Backfill),
            "content" => Ok(LoaderKind::Content),
            other => Err(AppError::config(format!("unknown loader '{other}'"))),
        }
    }
}

/// Address of one collection: `(community, loader, record type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionKey {
    pub community: String,
    pub loader: LoaderKind,
    pub record_type: RecordType,
}

impl CollectionKey {
    pub fn new(community: impl Into<String>, loader: LoaderKind, record_type: RecordType) -> Self {
        Self {
            community: normalize_community(&community.into()),
            loader,
            record_type,
        }
    }

    /// Relative directory of the collection inside a store root.
    pub fn relative_dir(&self) -> String {
        format!(
            "{}/{}/{}",
            self.community,
            self.loader.as_str(),
            self.record_type.as_str()
        )
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_dir())
    }
}

/// Communities are case-insensitive upstream; store them lowercase without a
/// leading `r/`.
pub fn normalize_community(name: &str) -> String {
    let name = name.trim();
    let name = name
        .strip_prefix("r/")
        .or_else(|| name.strip_prefix("/r/"))
        .unwrap_or(name);
    name.trim_matches('/').to_lowercase()
}
