//! Loaders: independently scheduled background tasks that move data from an
//! upstream source into the store.
//!
//! - `SearchLoader`: discovers ids through full-text search
//! - `CrawlerLoader`: discovers ids by paging a public listing
//! - `BackfillLoader`: discovers ids through an archive's time-window search
//! - `ContentLoader`: reconciles discovered ids into the canonical table
//!
//! All of them are driven by [`runner::run`] and stopped through the
//! [`signal`] channel pair.

mod backfill;
mod content;
mod crawler;
pub mod runner;
mod search;
pub mod signal;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::LoaderKind;

pub use backfill::BackfillLoader;
pub use content::{ContentLoader, Recheck, RemovalPolicy, merge_records, select_for_recheck};
pub use crawler::{CrawlerLoader, Sweep, SweepEnd, SweepOptions, sweep};
pub use runner::{LoaderHandle, LoaderState, run};
pub use search::SearchLoader;
pub use signal::{StopHandle, StopSignal, Wake};

/// Counters reported by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Rows written across all record types
    pub rows: usize,
    /// Record types processed
    pub record_types: usize,
    /// Record types whose pass was abandoned
    pub failures: usize,
}

impl PassSummary {
    pub(crate) fn record(&mut self, rows: usize, failed: bool) {
        self.rows += rows;
        self.record_types += 1;
        if failed {
            self.failures += 1;
        }
    }
}

/// A restartable unit of ingestion work.
#[async_trait]
pub trait Loader: Send {
    fn kind(&self) -> LoaderKind;

    fn community(&self) -> &str;

    /// Pause between passes in continuous mode.
    fn idle_period(&self) -> Duration;

    /// Run one pass over every configured record type.
    ///
    /// Transient failures are handled inside the pass. `Err(Interrupted)`
    /// means a stop request cut the pass short.
    async fn run_pass(&mut self, signal: &StopSignal) -> Result<PassSummary>;
}
