//! Directory-backed snapshot store.
//!
//! Layout under the root directory:
//!
//! ```text
//! blobs/<sha256>.txt                    sanitized configuration text
//! diffs/<snapshot-id>.json              diff against the baseline
//! devices/<hex(device-id)>/<seq>.json   snapshot metadata
//! ```
//!
//! Every file is written to a temporary name and renamed into place. The
//! metadata file is written last, so a snapshot is never visible without
//! its content and diff.

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{Diff, Snapshot, SnapshotStore};
use crate::error::{BackupError, Result};
use crate::model::DeviceId;

/// Appends for one device are serialized by that device's writer lock;
/// the shared index is only locked to read or to publish a finished append.
#[derive(Debug)]
pub struct FileSnapshotStore {
    root: PathBuf,
    index: RwLock<HashMap<DeviceId, Vec<Snapshot>>>,
    writers: StdMutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
}

impl FileSnapshotStore {
    /// Opens (or creates) a store rooted at `root` and loads the metadata
    /// index. Unreadable metadata files are skipped with a warning.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["blobs", "diffs", "devices"] {
            fs::create_dir_all(root.join(dir)).await.map_err(|e| {
                BackupError::StorageError(format!(
                    "failed to create {}: {e}",
                    root.join(dir).display()
                ))
            })?;
        }

        let index = load_index(&root.join("devices")).await?;
        debug!(
            "Opened snapshot store at {} ({} devices)",
            root.display(),
            index.len()
        );
        Ok(Self {
            root,
            index: RwLock::new(index),
            writers: StdMutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join("blobs").join(format!("{hash}.txt"))
    }

    fn diff_path(&self, id: Uuid) -> PathBuf {
        self.root.join("diffs").join(format!("{id}.json"))
    }

    fn device_dir(&self, device: &DeviceId) -> PathBuf {
        self.root.join("devices").join(encode_device(device))
    }

    fn writer(&self, device: &DeviceId) -> Arc<Mutex<()>> {
        self.writers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(device.clone())
            .or_default()
            .clone()
    }
}

fn encode_device(device: &DeviceId) -> String {
    hex::encode(device.as_str())
}

async fn load_index(devices: &Path) -> Result<HashMap<DeviceId, Vec<Snapshot>>> {
    let mut index: HashMap<DeviceId, Vec<Snapshot>> = HashMap::new();
    let mut dirs = fs::read_dir(devices).await?;
    while let Some(dir) = dirs.next_entry().await? {
        if !dir.file_type().await?.is_dir() {
            continue;
        }
        let mut files = fs::read_dir(dir.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).await?;
            match serde_json::from_str::<Snapshot>(&raw) {
                Ok(snapshot) => index.entry(snapshot.device.clone()).or_default().push(snapshot),
                Err(e) => warn!("Skipping unreadable snapshot {}: {e}", path.display()),
            }
        }
    }
    for list in index.values_mut() {
        list.sort_by_key(|s| s.seq);
    }
    Ok(index)
}

/// Writes `bytes` to a sibling temporary file, flushes it and renames it
/// over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let mut file = fs::File::create(&temp).await.map_err(|e| {
        BackupError::StorageError(format!("failed to create {}: {e}", temp.display()))
    })?;
    file.write_all(bytes).await.map_err(|e| {
        BackupError::StorageError(format!("failed to write {}: {e}", temp.display()))
    })?;
    file.sync_all().await.map_err(|e| {
        BackupError::StorageError(format!("failed to flush {}: {e}", temp.display()))
    })?;
    drop(file);
    fs::rename(&temp, path).await.map_err(|e| {
        BackupError::StorageError(format!("failed to rename into {}: {e}", path.display()))
    })?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn latest(&self, device: &DeviceId) -> Result<Option<Snapshot>> {
        Ok(self
            .index
            .read()
            .await
            .get(device)
            .and_then(|l| l.last().cloned()))
    }

    async fn latest_baseline(&self, device: &DeviceId) -> Result<Option<Snapshot>> {
        Ok(self
            .index
            .read()
            .await
            .get(device)
            .and_then(|l| l.iter().rev().find(|s| !s.is_duplicate()).cloned()))
    }

    async fn append(&self, snapshot: &Snapshot, content: &str, diff: Option<&Diff>) -> Result<()> {
        let writer = self.writer(&snapshot.device);
        let _guard = writer.lock().await;

        let expected = self
            .index
            .read()
            .await
            .get(&snapshot.device)
            .and_then(|l| l.last())
            .map(|s| s.seq + 1)
            .unwrap_or(1);
        if snapshot.seq != expected {
            return Err(BackupError::StorageError(format!(
                "{} sequence {} out of order (expected {expected})",
                snapshot.device, snapshot.seq
            )));
        }

        let blob = self.blob_path(&snapshot.hash);
        if !fs::try_exists(&blob).await.unwrap_or(false) {
            write_atomic(&blob, content.as_bytes()).await?;
        }
        if let Some(diff) = diff {
            let json = serde_json::to_vec_pretty(diff)?;
            write_atomic(&self.diff_path(snapshot.id), &json).await?;
        }

        let dir = self.device_dir(&snapshot.device);
        fs::create_dir_all(&dir).await.map_err(|e| {
            BackupError::StorageError(format!("failed to create {}: {e}", dir.display()))
        })?;
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&dir.join(format!("{:012}.json", snapshot.seq)), &json).await?;

        self.index
            .write()
            .await
            .entry(snapshot.device.clone())
            .or_default()
            .push(snapshot.clone());
        debug!(
            "Stored snapshot {} of {} (seq {})",
            snapshot.id, snapshot.device, snapshot.seq
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Snapshot>> {
        Ok(self
            .index
            .read()
            .await
            .values()
            .flat_map(|l| l.iter())
            .find(|s| s.id == id)
            .cloned())
    }

    async fn history(&self, device: &DeviceId) -> Result<Vec<Snapshot>> {
        Ok(self
            .index
            .read()
            .await
            .get(device)
            .cloned()
            .unwrap_or_default())
    }

    async fn content(&self, hash: &str) -> Result<Option<String>> {
        // Hashes are hex; anything else would escape the blob directory.
        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(None);
        }
        read_optional(&self.blob_path(hash)).await
    }

    async fn diff(&self, snapshot: Uuid) -> Result<Option<Diff>> {
        match read_optional(&self.diff_path(snapshot)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::content_hash;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn snapshot(device: &str, seq: u64, text: &str, duplicate_of: Option<Uuid>) -> Snapshot {
        Snapshot {
            id: Uuid::new_v4(),
            device: DeviceId::from(device),
            seq,
            captured_at: Utc::now(),
            hash: content_hash(text),
            size: text.len(),
            duplicate_of,
            baseline: None,
            duration_ms: 10,
            info: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn append_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = snapshot("core/sw1", 1, "hostname sw1", None);
        let diff = Diff::compute(None, first.id, "", "hostname sw1");
        {
            let store = FileSnapshotStore::open(dir.path()).await.expect("open");
            store
                .append(&first, "hostname sw1", Some(&diff))
                .await
                .expect("append");
        }

        let store = FileSnapshotStore::open(dir.path()).await.expect("reopen");
        let device = DeviceId::from("core/sw1");
        let latest = store.latest(&device).await.expect("latest").expect("some");
        assert_eq!(latest, first);
        assert_eq!(
            store.content(&first.hash).await.expect("content").as_deref(),
            Some("hostname sw1")
        );
        assert_eq!(store.diff(first.id).await.expect("diff"), Some(diff));
    }

    #[tokio::test]
    async fn duplicate_content_is_stored_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSnapshotStore::open(dir.path()).await.expect("open");
        let first = snapshot("r1", 1, "hostname r1", None);
        let second = snapshot("r1", 2, "hostname r1", Some(first.id));
        store.append(&first, "hostname r1", None).await.expect("first");
        store.append(&second, "hostname r1", None).await.expect("second");

        let blobs = std::fs::read_dir(dir.path().join("blobs"))
            .expect("blobs")
            .count();
        assert_eq!(blobs, 1);
        let baseline = store
            .latest_baseline(&DeviceId::from("r1"))
            .await
            .expect("baseline")
            .expect("some");
        assert_eq!(baseline.id, first.id);
        assert_eq!(store.history(&DeviceId::from("r1")).await.expect("history").len(), 2);
    }

    #[tokio::test]
    async fn devices_append_concurrently_with_shared_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileSnapshotStore::open(dir.path()).await.expect("open"));
        let mut appends = tokio::task::JoinSet::new();
        for n in 0..8 {
            let store = store.clone();
            appends.spawn(async move {
                let device = format!("sw{n}");
                let first = snapshot(&device, 1, "snmp-server community ro", None);
                store
                    .append(&first, "snmp-server community ro", None)
                    .await?;
                let second = snapshot(&device, 2, &format!("hostname {device}"), None);
                store
                    .append(&second, &format!("hostname {device}"), None)
                    .await
            });
        }
        while let Some(joined) = appends.join_next().await {
            joined.expect("join").expect("append");
        }

        for n in 0..8 {
            let history = store
                .history(&DeviceId::new(format!("sw{n}")))
                .await
                .expect("history");
            assert_eq!(history.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![1, 2]);
        }
        let blobs: Vec<_> = std::fs::read_dir(dir.path().join("blobs"))
            .expect("blobs")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(blobs.len(), 9);
        assert!(blobs.iter().all(|name| name.ends_with(".txt")));
    }

    #[tokio::test]
    async fn out_of_order_sequence_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSnapshotStore::open(dir.path()).await.expect("open");
        let err = store
            .append(&snapshot("r1", 2, "x", None), "x", None)
            .await
            .expect_err("gap");
        assert_eq!(err.kind(), crate::error::ErrorKind::StorageError);
    }

    #[test]
    fn device_directories_are_hex_encoded_ids() {
        assert_eq!(encode_device(&DeviceId::from("core/sw1")), "636f72652f737731");
    }

    #[tokio::test]
    async fn non_hex_hash_reads_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSnapshotStore::open(dir.path()).await.expect("open");
        assert_eq!(store.content("../secret").await.expect("content"), None);
    }
}
