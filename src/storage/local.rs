//! Local filesystem storage implementation.
//!
//! ## Guarantees
//!
//! - **Atomic files**: every file is written to a temp path and renamed
//! - **Pointer swap**: tables are versioned; `manifest.json` names the current
//!   version, so a reader never sees a partially written table
//! - **Checksums**: the manifest carries the table's SHA-256, verified on read
//! - **Retention**: without snapshots only the current and previous versions
//!   are kept; snapshot writes are kept forever

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{CollectionKey, LoaderKind, Metadata, RecordType, Row};
use crate::storage::{CollectionInfo, TableRef, TableStore, WriteOptions};

const MANIFEST: &str = "manifest.json";
const TABLES: &str = "tables";

/// Manifest document, the single source of truth for a collection.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
struct Manifest {
    #[serde(default)]
    table: Option<TableRef>,
    #[serde(default)]
    metadata: Metadata,
    /// Table files retained as dated snapshots
    #[serde(default)]
    snapshots: Vec<String>,
}

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root_dir: PathBuf,
}

impl LocalStore {
    /// Create a new LocalStore rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    fn collection_dir(&self, key: &CollectionKey) -> PathBuf {
        self.root_dir.join(key.relative_dir())
    }

    fn manifest_path(&self, key: &CollectionKey) -> PathBuf {
        self.collection_dir(key).join(MANIFEST)
    }

    fn table_path(&self, key: &CollectionKey, file: &str) -> PathBuf {
        self.collection_dir(key).join(TABLES).join(file)
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        self.ensure_dir(path).await?;

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read JSON data.
    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match self.read_bytes(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_manifest(&self, key: &CollectionKey) -> Result<Manifest> {
        Ok(self
            .read_json(&self.manifest_path(key))
            .await?
            .unwrap_or_default())
    }

    async fn write_manifest(&self, key: &CollectionKey, manifest: &Manifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        self.write_bytes(&self.manifest_path(key), &bytes).await
    }

    /// Load the rows a table pointer refers to; None if the file is gone.
    async fn load_rows<R: Row>(
        &self,
        key: &CollectionKey,
        table: &TableRef,
    ) -> Result<Option<Vec<R>>> {
        let Some(bytes) = self.read_bytes(&self.table_path(key, &table.file)).await? else {
            return Ok(None);
        };

        let checksum = checksum(&bytes);
        if checksum != table.checksum {
            return Err(AppError::corrupt(
                key,
                format!(
                    "checksum mismatch for {} (manifest {}, file {})",
                    table.file, table.checksum, checksum
                ),
            ));
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Delete table files that are neither current, previous, nor snapshots,
    /// along with temp files left behind by an interrupted write.
    async fn prune(&self, key: &CollectionKey, keep: &HashSet<&str>) -> Result<usize> {
        let dir = self.collection_dir(key).join(TABLES);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let table_file = name.ends_with(".json") || name.ends_with(".tmp");
            if !table_file || keep.contains(name.as_str()) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(AppError::Io(e)),
            }
        }
        Ok(removed)
    }

    /// Every collection that has a manifest under the root.
    pub async fn list_collections(&self) -> Result<Vec<CollectionKey>> {
        let mut keys = Vec::new();
        for community in list_dirs(&self.root_dir).await? {
            for loader in list_dirs(&self.root_dir.join(&community)).await? {
                let Ok(loader_kind) = loader.parse::<LoaderKind>() else {
                    continue;
                };
                let loader_dir = self.root_dir.join(&community).join(&loader);
                for record_type in list_dirs(&loader_dir).await? {
                    let Ok(record_type) = record_type.parse::<RecordType>() else {
                        continue;
                    };
                    let key = CollectionKey::new(community.clone(), loader_kind, record_type);
                    if tokio::fs::try_exists(self.manifest_path(&key)).await? {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl TableStore for LocalStore {
    async fn read_table<R: Row>(&self, key: &CollectionKey) -> Result<Vec<R>> {
        // A concurrent writer may prune the version we resolved; one re-read
        // of the manifest picks up the newer pointer.
        for _ in 0..2 {
            let manifest = self.read_manifest(key).await?;
            let Some(table) = manifest.table else {
                return Ok(Vec::new());
            };
            if let Some(rows) = self.load_rows(key, &table).await? {
                return Ok(rows);
            }
        }
        Err(AppError::corrupt(key, "table file referenced by manifest is missing"))
    }

    async fn write_table<R: Row>(
        &self,
        key: &CollectionKey,
        rows: &[R],
        options: WriteOptions,
    ) -> Result<TableRef> {
        let mut manifest = self.read_manifest(key).await?;

        let mut table: Vec<R> = match (&manifest.table, options.overwrite) {
            (Some(current), false) => self.load_rows(key, current).await?.ok_or_else(|| {
                AppError::corrupt(key, format!("cannot append, {} is missing", current.file))
            })?,
            _ => Vec::with_capacity(rows.len()),
        };
        table.extend_from_slice(rows);

        let bytes = serde_json::to_vec(&table)?;
        let now = Utc::now();
        let version = manifest.table.as_ref().map_or(1, |t| t.version + 1);
        let file = format!("{:08}-{}.json", version, now.format("%Y%m%dT%H%M%S"));

        self.write_bytes(&self.table_path(key, &file), &bytes).await?;

        let table_ref = TableRef {
            version,
            file: file.clone(),
            rows: table.len(),
            checksum: checksum(&bytes),
            written_at: now,
        };
        let previous = manifest.table.replace(table_ref.clone());
        if options.snapshot {
            manifest.snapshots.push(file.clone());
        }
        self.write_manifest(key, &manifest).await?;

        let mut keep: HashSet<&str> = manifest.snapshots.iter().map(String::as_str).collect();
        keep.insert(&file);
        if let Some(previous) = &previous {
            keep.insert(&previous.file);
        }
        let pruned = self.prune(key, &keep).await?;

        log::debug!(
            "Stored {} rows in {} (version {}, {} old versions pruned)",
            table_ref.rows,
            key,
            version,
            pruned
        );
        Ok(table_ref)
    }

    async fn read_metadata(&self, key: &CollectionKey) -> Result<Metadata> {
        Ok(self.read_manifest(key).await?.metadata)
    }

    async fn write_metadata(&self, key: &CollectionKey, fields: Metadata) -> Result<()> {
        let mut manifest = self.read_manifest(key).await?;
        manifest.metadata.extend(fields);
        self.write_manifest(key, &manifest).await
    }

    async fn collection_info(&self, key: &CollectionKey) -> Result<CollectionInfo> {
        let manifest = self.read_manifest(key).await?;
        Ok(CollectionInfo {
            table: manifest.table,
            metadata: manifest.metadata,
        })
    }
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn list_dirs(path: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::Io(e)),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscoveryEntry;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn key() -> CollectionKey {
        CollectionKey::new("stocks", LoaderKind::Crawler, RecordType::Submission)
    }

    fn entry(id: &str, created: i64) -> DiscoveryEntry {
        DiscoveryEntry {
            id: id.to_string(),
            community: "stocks".to_string(),
            author: "someone".to_string(),
            created: Utc.timestamp_opt(created, 0).unwrap(),
            retrieved: Utc.timestamp_opt(created + 5, 0).unwrap(),
            parent: None,
        }
    }

    fn ids(rows: &[DiscoveryEntry]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    async fn table_files(store: &LocalStore) -> usize {
        list_files(&store.collection_dir(&key()).join(TABLES)).await
    }

    async fn list_files(dir: &Path) -> usize {
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        let mut count = 0;
        while let Some(_) = entries.next_entry().await.unwrap() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_read_missing_collection() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let rows: Vec<DiscoveryEntry> = store.read_table(&key()).await.unwrap();
        assert!(rows.is_empty());
        assert!(store.read_metadata(&key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_keeps_existing_rows() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        store
            .write_table(&key(), &[entry("a", 1), entry("b", 2)], WriteOptions::append())
            .await
            .unwrap();
        let table = store
            .write_table(&key(), &[entry("c", 3)], WriteOptions::append())
            .await
            .unwrap();

        let rows: Vec<DiscoveryEntry> = store.read_table(&key()).await.unwrap();
        assert_eq!(ids(&rows), vec!["a", "b", "c"]);
        assert_eq!(table.rows, 3);
        assert_eq!(table.version, 2);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_table() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        store
            .write_table(&key(), &[entry("a", 1), entry("b", 2)], WriteOptions::append())
            .await
            .unwrap();
        store
            .write_table(&key(), &[entry("z", 9)], WriteOptions::overwrite())
            .await
            .unwrap();

        let rows: Vec<DiscoveryEntry> = store.read_table(&key()).await.unwrap();
        assert_eq!(ids(&rows), vec!["z"]);
    }

    #[tokio::test]
    async fn test_metadata_merges_fields() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let mut first = Metadata::new();
        first.insert("last_run".into(), 10.into());
        first.insert("end_run".into(), 5.into());
        store.write_metadata(&key(), first).await.unwrap();

        let mut second = Metadata::new();
        second.insert("last_run".into(), 20.into());
        store.write_metadata(&key(), second).await.unwrap();

        let metadata = store.read_metadata(&key()).await.unwrap();
        assert_eq!(metadata.get("last_run"), Some(&20.into()));
        assert_eq!(metadata.get("end_run"), Some(&5.into()));
    }

    #[tokio::test]
    async fn test_table_write_preserves_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let mut fields = Metadata::new();
        fields.insert("last_run".into(), 10.into());
        store.write_metadata(&key(), fields).await.unwrap();
        store
            .write_table(&key(), &[entry("a", 1)], WriteOptions::append())
            .await
            .unwrap();

        let info = store.collection_info(&key()).await.unwrap();
        assert_eq!(info.metadata.get("last_run"), Some(&10.into()));
        assert_eq!(info.table.unwrap().rows, 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let table = store
            .write_table(&key(), &[entry("a", 1)], WriteOptions::append())
            .await
            .unwrap();
        tokio::fs::write(store.table_path(&key(), &table.file), b"[]")
            .await
            .unwrap();

        let result: Result<Vec<DiscoveryEntry>> = store.read_table(&key()).await;
        assert!(matches!(result, Err(AppError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_retention_without_snapshots() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        for i in 0..4 {
            store
                .write_table(&key(), &[entry(&format!("r{i}"), i)], WriteOptions::append())
                .await
                .unwrap();
        }
        assert_eq!(table_files(&store).await, 2);
    }

    #[tokio::test]
    async fn test_stale_temp_files_are_pruned() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let tables = store.collection_dir(&key()).join(TABLES);
        std::fs::create_dir_all(&tables).unwrap();
        std::fs::write(tables.join("00000001-20260101T000000.tmp"), b"[").unwrap();

        store
            .write_table(&key(), &[entry("a", 1)], WriteOptions::append())
            .await
            .unwrap();

        assert!(!tables.join("00000001-20260101T000000.tmp").exists());
        assert_eq!(table_files(&store).await, 1);
    }

    #[tokio::test]
    async fn test_snapshots_are_retained() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        let snapshot = WriteOptions::append().with_snapshot(true);
        for i in 0..3 {
            store
                .write_table(&key(), &[entry(&format!("s{i}"), i)], snapshot)
                .await
                .unwrap();
        }
        store
            .write_table(&key(), &[entry("plain", 9)], WriteOptions::append())
            .await
            .unwrap();

        assert_eq!(table_files(&store).await, 4);
    }

    #[tokio::test]
    async fn test_list_collections() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());

        store
            .write_table(&key(), &[entry("a", 1)], WriteOptions::append())
            .await
            .unwrap();
        let other = CollectionKey::new("stocks", LoaderKind::Search, RecordType::Submission);
        store.write_metadata(&other, Metadata::new()).await.unwrap();
        tokio::fs::create_dir_all(tmp.path().join("stocks/unknown/submission"))
            .await
            .unwrap();

        let keys = store.list_collections().await.unwrap();
        assert_eq!(keys, vec![other, key()]);
    }
}
