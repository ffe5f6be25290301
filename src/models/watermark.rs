// src/models/watermark.rs

//! Persisted progress markers.

use chrono::serde::{ts_seconds, ts_seconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Free-form metadata document stored next to a collection table.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Fetch progress of one loader for one record type.
///
/// Optional fields are always serialized (as `null` when unset) so that a
/// metadata merge clears state that no longer applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Boundary up to which data has been processed
    #[serde(with = "ts_seconds")]
    pub last_run: DateTime<Utc>,

    /// Oldest boundary reached by a backward sweep
    #[serde(default, with = "ts_seconds_option")]
    pub end_run: Option<DateTime<Utc>>,

    /// Page to resume an interrupted backward sweep from
    #[serde(default)]
    pub cursor: Option<String>,

    /// Value `last_run` takes once the interrupted sweep completes
    #[serde(default, with = "ts_seconds_option")]
    pub pending_run: Option<DateTime<Utc>>,
}

impl Watermark {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            last_run: start,
            end_run: None,
            cursor: None,
            pending_run: None,
        }
    }

    /// Start from the configured value unless a persisted one exists.
    pub fn restore(start: DateTime<Utc>, metadata: &Metadata) -> Result<Self> {
        if !metadata.contains_key("last_run") {
            return Ok(Self::new(start));
        }
        Ok(serde_json::from_value(serde_json::Value::Object(
            metadata.clone(),
        ))?)
    }

    pub fn to_metadata(&self) -> Result<Metadata> {
        Ok(serde_json::to_value(self)?
            .as_object()
            .cloned()
            .unwrap_or_default())
    }

    /// Move `last_run` forward; earlier values are ignored.
    pub fn advance(&mut self, to: DateTime<Utc>) -> bool {
        if to > self.last_run {
            self.last_run = to;
            true
        } else {
            false
        }
    }

    pub fn is_resuming(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn clear_resume(&mut self) {
        self.end_run = None;
        self.cursor = None;
        self.pending_run = None;
    }
}
