// src/models/mod.rs

//! Domain models for the harvester.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod collection;
mod config;
mod record;
mod watermark;

// Re-export all public types
pub use collection::{CollectionKey, LoaderKind, normalize_community};
pub use config::{
    BackfillConfig, Config, ContentConfig, CrawlerConfig, HttpConfig, PublishConfig, RunMode, SearchConfig,
    StoreConfig, SupervisorConfig, UpstreamConfig,
};
pub use record::{
    Column, ColumnKind, DELETED_AUTHOR, DiscoveryEntry, RecordType, Row, Schema, Submission,
    sort_rows,
};
pub use watermark::{Metadata, Watermark};
