//! In-memory snapshot store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::{Diff, Snapshot, SnapshotStore};
use crate::error::{BackupError, Result};
use crate::model::DeviceId;

#[derive(Debug, Default)]
struct Inner {
    by_device: HashMap<DeviceId, Vec<Snapshot>>,
    by_id: HashMap<Uuid, Snapshot>,
    blobs: HashMap<String, Arc<str>>,
    diffs: HashMap<Uuid, Diff>,
}

/// Snapshot store kept in process memory.
///
/// `fail_next_appends` makes the next appends fail with `StorageError` and
/// `delay_appends` slows every append down, which is how persistence
/// failures and storage timeouts are exercised in tests.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    inner: RwLock<Inner>,
    failures: AtomicUsize,
    append_delay_ms: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_appends(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn delay_appends(&self, delay: Duration) {
        self.append_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of distinct content blobs held.
    pub fn blob_count(&self) -> usize {
        self.inner.read().map(|i| i.blobs.len()).unwrap_or_default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|e| BackupError::StorageError(format!("snapshot store lock poisoned: {e}")))
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn latest(&self, device: &DeviceId) -> Result<Option<Snapshot>> {
        Ok(self
            .read()?
            .by_device
            .get(device)
            .and_then(|list| list.last().cloned()))
    }

    async fn latest_baseline(&self, device: &DeviceId) -> Result<Option<Snapshot>> {
        Ok(self.read()?.by_device.get(device).and_then(|list| {
            list.iter().rev().find(|s| !s.is_duplicate()).cloned()
        }))
    }

    async fn append(&self, snapshot: &Snapshot, content: &str, diff: Option<&Diff>) -> Result<()> {
        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(BackupError::StorageError(format!(
                "injected failure persisting snapshot {}",
                snapshot.id
            )));
        }

        let mut inner = self
            .inner
            .write()
            .map_err(|e| BackupError::StorageError(format!("snapshot store lock poisoned: {e}")))?;
        let expected = inner
            .by_device
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

        inner
            .blobs
            .entry(snapshot.hash.clone())
            .or_insert_with(|| Arc::from(content));
        if let Some(diff) = diff {
            inner.diffs.insert(snapshot.id, diff.clone());
        }
        inner.by_id.insert(snapshot.id, snapshot.clone());
        inner
            .by_device
            .entry(snapshot.device.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Snapshot>> {
        Ok(self.read()?.by_id.get(&id).cloned())
    }

    async fn history(&self, device: &DeviceId) -> Result<Vec<Snapshot>> {
        Ok(self
            .read()?
            .by_device
            .get(device)
            .cloned()
            .unwrap_or_default())
    }

    async fn content(&self, hash: &str) -> Result<Option<String>> {
        Ok(self.read()?.blobs.get(hash).map(|b| b.to_string()))
    }

    async fn diff(&self, snapshot: Uuid) -> Result<Option<Diff>> {
        Ok(self.read()?.diffs.get(&snapshot).cloned())
    }
}
