// src/utils/log.rs

//! Log formatting helpers on top of the `log` facade.
//!
//! Loaders log through a [`LoaderLog`] handle so every line names the loader
//! and community it came from:
//!
//! ```text
//! [2026-01-01T12:00:00Z INFO  harvester::utils::log]  crawler  | r/stocks | fetched 25 submissions
//! ```

use crate::models::{LoaderKind, normalize_community};

/// Width the loader name is centred in.
const NAME_WIDTH: usize = 9;

/// Per-loader logging handle.
#[derive(Debug, Clone)]
pub struct LoaderLog {
    name: &'static str,
    community: String,
}

impl LoaderLog {
    pub fn new(kind: LoaderKind, community: &str) -> Self {
        Self::named(kind.as_str(), community)
    }

    pub fn named(name: &'static str, community: &str) -> Self {
        Self {
            name,
            community: normalize_community(community),
        }
    }

    fn line(&self, message: &str) -> String {
        format!(
            "{:^width$} | r/{} | {}",
            self.name,
            self.community,
            message,
            width = NAME_WIDTH
        )
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        log::debug!("{}", self.line(message.as_ref()));
    }

    pub fn info(&self, message: impl AsRef<str>) {
        log::info!("{}", self.line(message.as_ref()));
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        log::warn!("{}", self.line(message.as_ref()));
    }

    pub fn error(&self, message: impl AsRef<str>) {
        log::error!("{}", self.line(message.as_ref()));
    }
}

/// Log a banner line, e.g. `---------- STARTED ----------`.
pub fn banner(title: &str) {
    log::info!("{}{:^15}{}", "-".repeat(30), title, "-".repeat(30));
}

/// Log a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    log::info!("[SUMMARY] {}", title);
    for (key, value) in items {
        log::info!("    {}: {}", key, value);
    }
}
