//! Storage abstractions for collection persistence.
//!
//! Every collection is a table of rows plus a small metadata document,
//! addressed by `(community, loader, record type)`:
//!
//! ```text
//! {root}/
//! └── {community}/
//!     └── {loader}/
//!         └── {record_type}/
//!             ├── manifest.json     # Table pointer + metadata
//!             └── tables/
//!                 ├── 00000007-20260101T120000.json
//!                 └── 00000008-20260101T121000.json
//! ```
//!
//! A table write stores a new version file and then swaps the manifest
//! pointer, so readers only ever see fully written tables.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{CollectionKey, Metadata, Row};

// Re-export for convenience
pub use local::LocalStore;

/// How a table write treats existing rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Replace the stored table instead of appending to it
    pub overwrite: bool,
    /// Keep the superseded table version as a dated copy
    pub snapshot: bool,
}

impl WriteOptions {
    pub fn append() -> Self {
        Self {
            overwrite: false,
            snapshot: false,
        }
    }

    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            snapshot: false,
        }
    }

    pub fn with_snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }
}

/// Pointer from a manifest to the table version it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub version: u64,
    /// File name relative to the collection's `tables/` directory
    pub file: String,
    pub rows: usize,
    /// Hex SHA-256 of the table file
    pub checksum: String,
    pub written_at: DateTime<Utc>,
}

/// Summary of a stored collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub table: Option<TableRef>,
    pub metadata: Metadata,
}

/// Trait for collection storage backends.
///
/// Backends never retry; I/O errors go straight back to the caller.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Read the current table; empty when the collection has none.
    async fn read_table<R: Row>(&self, key: &CollectionKey) -> Result<Vec<R>>;

    /// Write a table.
    ///
    /// Replaces the stored table when `options.overwrite` is set or no table
    /// exists yet, otherwise appends `rows` after the existing ones.
    async fn write_table<R: Row>(
        &self,
        key: &CollectionKey,
        rows: &[R],
        options: WriteOptions,
    ) -> Result<TableRef>;

    /// Read the metadata document; empty when absent.
    async fn read_metadata(&self, key: &CollectionKey) -> Result<Metadata>;

    /// Merge `fields` into the metadata document.
    ///
    /// Callers write the table first and the metadata second, so metadata
    /// never describes rows that were not stored.
    async fn write_metadata(&self, key: &CollectionKey, fields: Metadata) -> Result<()>;

    /// Manifest details for diagnostics.
    async fn collection_info(&self, key: &CollectionKey) -> Result<CollectionInfo>;
}
