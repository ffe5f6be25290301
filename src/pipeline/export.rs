// src/pipeline/export.rs

//! Export step: copies every canonical table out of the store and describes
//! the result in a `datapackage.json`.
//!
//! ```text
//! {export_dir}/
//! ├── datapackage.json
//! └── {community}/
//!     └── submission.json
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::Result;
use crate::models::{
    CollectionKey, Config, DiscoveryEntry, LoaderKind, RecordType, Row, Submission,
    normalize_community,
};
use crate::storage::TableStore;
use crate::utils::log::{banner, summary};
use crate::utils::{fmt_time, now_secs};

/// Outcome of an export run.
#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    /// Non-empty tables exported
    pub resources: usize,
    pub rows: usize,
    pub package: PathBuf,
}

#[derive(Debug, Serialize)]
struct DataPackage {
    title: String,
    description: String,
    updated: String,
    resources: Vec<Resource>,
}

#[derive(Debug, Serialize)]
struct Resource {
    name: String,
    path: String,
    description: String,
    rows: usize,
    schema: ResourceSchema,
}

#[derive(Debug, Serialize)]
struct ResourceSchema {
    fields: Vec<Field>,
}

#[derive(Debug, Serialize)]
struct Field {
    name: &'static str,
    title: &'static str,
    description: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Tracks when the next export is due.
#[derive(Debug, Clone)]
pub struct PublishTimer {
    interval: Duration,
    last: Instant,
}

impl PublishTimer {
    /// The first export is due one `interval` after creation.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn is_due(&self) -> bool {
        self.is_enabled() && self.last.elapsed() >= self.interval
    }

    pub fn reset(&mut self) {
        self.last = Instant::now();
    }
}

/// Export the canonical tables of `communities`.
pub async fn run_export<S: TableStore>(
    config: &Config,
    communities: &[String],
    store: &S,
) -> Result<ExportSummary> {
    let root = &config.publish.export_dir;
    let mut resources = Vec::new();

    for community in communities {
        let community = normalize_community(community);
        for record_type in config.record_types(LoaderKind::Content) {
            let key = CollectionKey::new(&community, LoaderKind::Content, record_type);
            let resource = match record_type {
                RecordType::Submission => export_table::<Submission, S>(root, &key, store).await?,
                RecordType::Comment => export_table::<DiscoveryEntry, S>(root, &key, store).await?,
            };
            match resource {
                Some(resource) => {
                    summary(
                        &format!("r/{community} {record_type}s"),
                        &[("rows", resource.rows.to_string()), ("path", resource.path.clone())],
                    );
                    resources.push(resource);
                }
                None => log::debug!("nothing to export for {key}"),
            }
        }
    }

    let rows = resources.iter().map(|r| r.rows).sum();
    let package = DataPackage {
        title: config.publish.title.clone(),
        description: resources
            .iter()
            .map(|r| r.description.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        updated: fmt_time(now_secs()),
        resources,
    };

    let path = root.join("datapackage.json");
    write_json(&path, &package).await?;
    banner("EXPORTED");

    Ok(ExportSummary {
        resources: package.resources.len(),
        rows,
        package: path,
    })
}

async fn export_table<R: Row, S: TableStore>(
    root: &Path,
    key: &CollectionKey,
    store: &S,
) -> Result<Option<Resource>> {
    let rows: Vec<R> = store.read_table(key).await?;
    let (Some(from), Some(to)) = (
        rows.iter().map(|r| r.created()).min(),
        rows.iter().map(|r| r.created()).max(),
    ) else {
        return Ok(None);
    };

    let name = format!("{}.json", key.record_type);
    let relative = format!("{}/{}", key.community, name);
    write_json(&root.join(&relative), &rows).await?;

    let link = format!("r/{}", key.community);
    let fields = key
        .record_type
        .canonical_schema()
        .columns
        .iter()
        .map(|c| Field {
            name: c.name,
            title: c.name,
            description: c.description,
            kind: c.kind.as_str(),
        })
        .collect();

    Ok(Some(Resource {
        name,
        path: relative,
        description: format!(
            "[{link}](https://reddit.com/{link}) | {} | {} | *{}*",
            fmt_time(from),
            fmt_time(to),
            rows.len()
        ),
        rows: rows.len(),
        schema: ResourceSchema { fields },
    }))
}

/// Write pretty JSON through a temporary file.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
