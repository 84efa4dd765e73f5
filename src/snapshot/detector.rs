use log::{debug, info};
use moka::future::Cache;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{Diff, Snapshot, SnapshotStore, additional_stream, content_hash};
use crate::capture::CapturePayload;
use crate::error::{BackupError, Result};
use crate::model::DeviceId;

/// Outcome of recording one capture.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub snapshot: Snapshot,
    /// Diff against the baseline; `None` for duplicates.
    pub diff: Option<Arc<Diff>>,
    /// Content differs from an existing baseline.
    pub changed: bool,
    /// No prior snapshot existed for the device.
    pub first_capture: bool,
    /// Hash of the baseline the diff was computed against.
    pub old_hash: Option<String>,
    /// Additional show command output recorded with this capture.
    pub additional: Option<Box<Recorded>>,
}

/// Hashes captures, detects duplicates and computes diffs.
///
/// Callers must hold the device lease around [`ChangeDetector::record`] so
/// the latest/baseline read and the append see a stable history.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn SnapshotStore>,
    diffs: Cache<Uuid, Arc<Diff>>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn SnapshotStore>, cache_capacity: u64) -> Self {
        let diffs = Cache::builder()
            .max_capacity(cache_capacity)
            .time_to_idle(Duration::from_secs(10 * 60))
            .build();
        Self { store, diffs }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Records a capture as the next snapshot of `device`.
    ///
    /// A capture whose hash equals the latest snapshot's is stored as a
    /// duplicate of it without a diff. Otherwise the diff is computed
    /// against the latest non-duplicate snapshot (or the empty text for a
    /// first capture) and persisted with the snapshot.
    pub async fn record(&self, device: &DeviceId, payload: &CapturePayload) -> Result<Recorded> {
        let hash = content_hash(&payload.text);
        let latest = self.store.latest(device).await?;
        let seq = latest.as_ref().map(|s| s.seq + 1).unwrap_or(1);

        let mut snapshot = Snapshot {
            id: Uuid::new_v4(),
            device: device.clone(),
            seq,
            captured_at: chrono::Utc::now(),
            hash,
            size: payload.text.len(),
            duplicate_of: None,
            baseline: None,
            duration_ms: u64::try_from(payload.duration.as_millis()).unwrap_or(u64::MAX),
            info: payload.info.clone(),
        };

        if let Some(latest) = latest.as_ref()
            && latest.hash == snapshot.hash
        {
            snapshot.duplicate_of = Some(latest.id);
            self.store.append(&snapshot, &payload.text, None).await?;
            debug!("{device}: capture unchanged, duplicate of {}", latest.id);
            return Ok(Recorded {
                snapshot,
                diff: None,
                changed: false,
                first_capture: false,
                old_hash: Some(latest.hash.clone()),
                additional: None,
            });
        }

        let baseline = self.store.latest_baseline(device).await?;
        let old_text = match baseline.as_ref() {
            Some(base) => self.store.content(&base.hash).await?.ok_or_else(|| {
                BackupError::StorageError(format!(
                    "content {} of baseline {} is missing",
                    base.hash, base.id
                ))
            })?,
            None => String::new(),
        };
        snapshot.baseline = baseline.as_ref().map(|b| b.id);

        let diff = Arc::new(Diff::compute(
            snapshot.baseline,
            snapshot.id,
            &old_text,
            &payload.text,
        ));
        self.store
            .append(&snapshot, &payload.text, Some(&diff))
            .await?;
        self.diffs.insert(snapshot.id, diff.clone()).await;

        let changed = baseline.is_some();
        if changed {
            info!(
                "{device}: configuration changed (+{} -{})",
                diff.summary.added, diff.summary.removed
            );
        } else {
            debug!("{device}: first snapshot {}", snapshot.id);
        }
        Ok(Recorded {
            snapshot,
            diff: Some(diff),
            changed,
            first_capture: baseline.is_none(),
            old_hash: baseline.map(|b| b.hash),
            additional: None,
        })
    }

    /// Records the additional show command output of a capture in the
    /// device's own additional history, deduplicated and diffed the same
    /// way as configuration. `None` when the capture has no such output.
    pub async fn record_additional(
        &self,
        device: &DeviceId,
        payload: &CapturePayload,
    ) -> Result<Option<Recorded>> {
        let Some(text) = payload.additional.as_ref() else {
            return Ok(None);
        };
        let extra = CapturePayload {
            text: text.clone(),
            raw_size: text.len(),
            duration: payload.duration,
            info: BTreeMap::new(),
            additional: None,
        };
        self.record(&additional_stream(device), &extra)
            .await
            .map(Some)
    }

    /// Stored diff of a snapshot against its baseline.
    pub async fn diff(&self, snapshot: Uuid) -> Result<Option<Arc<Diff>>> {
        if let Some(diff) = self.diffs.get(&snapshot).await {
            return Ok(Some(diff));
        }
        match self.store.diff(snapshot).await? {
            Some(diff) => {
                let diff = Arc::new(diff);
                self.diffs.insert(snapshot, diff.clone()).await;
                Ok(Some(diff))
            }
            None => Ok(None),
        }
    }

    /// Diff between two arbitrary snapshots, `from` first.
    pub async fn compare(&self, from: Uuid, to: Uuid) -> Result<Diff> {
        let old = self.snapshot_text(from).await?;
        let new = self.snapshot_text(to).await?;
        Ok(Diff::compute(Some(from), to, &old, &new))
    }

    /// Configuration text of a snapshot.
    pub async fn snapshot_text(&self, id: Uuid) -> Result<String> {
        let snapshot = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| BackupError::StorageError(format!("snapshot {id} not found")))?;
        self.store.content(&snapshot.hash).await?.ok_or_else(|| {
            BackupError::StorageError(format!("content {} of snapshot {id} is missing", snapshot.hash))
        })
    }
}
