//! Pipeline entry points.
//!
//! - `run_fetch`: Drive the enabled loaders over the configured communities
//! - `run_export`: Copy the canonical tables out and describe them

pub mod export;
pub mod fetch;

pub use export::{ExportSummary, PublishTimer, run_export};
pub use fetch::{FetchSummary, Sources, build_loader, build_loaders, run_fetch, stop_all};
