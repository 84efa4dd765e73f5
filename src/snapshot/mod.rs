//! Versioned configuration history.
//!
//! A [`Snapshot`] is the immutable record of one successful capture. Content
//! is addressed by its SHA-256 hash and stored once; snapshots of a device
//! form an append-only sequence. The [`ChangeDetector`] decides whether a
//! capture is a duplicate and computes the diff against the baseline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::Result;
use crate::model::DeviceId;

pub use detector::{ChangeDetector, Recorded};
pub use diff::{Diff, DiffLine, DiffSummary, diff_lines};
pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

mod detector;
mod diff;
mod file;
mod memory;

/// Immutable record of one capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub device: DeviceId,
    /// Position in the device's history, starting at 1.
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    /// SHA-256 of the sanitized text, lowercase hex.
    pub hash: String,
    pub size: usize,
    /// Prior snapshot with the same hash.
    pub duplicate_of: Option<Uuid>,
    /// Snapshot this one was diffed against.
    pub baseline: Option<Uuid>,
    pub duration_ms: u64,
    #[serde(default)]
    pub info: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }
}

/// SHA-256 of `text` as lowercase hex.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// History key under which a device's additional show command output is
/// recorded, kept apart from its configuration history.
pub fn additional_stream(device: &DeviceId) -> DeviceId {
    DeviceId::new(format!("{device}#additional"))
}

/// Persistence for snapshots, content blobs and diffs.
///
/// Callers hold the device lease while appending, so implementations only
/// need to make each append atomic; a snapshot becomes visible together with
/// its content and diff, never before.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Newest snapshot of a device.
    async fn latest(&self, device: &DeviceId) -> Result<Option<Snapshot>>;

    /// Newest non-duplicate snapshot of a device.
    async fn latest_baseline(&self, device: &DeviceId) -> Result<Option<Snapshot>>;

    /// Appends a snapshot. `content` is stored under the snapshot hash if
    /// absent; `diff` is stored keyed by the snapshot id.
    async fn append(&self, snapshot: &Snapshot, content: &str, diff: Option<&Diff>) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Snapshot>>;

    /// All snapshots of a device, oldest first.
    async fn history(&self, device: &DeviceId) -> Result<Vec<Snapshot>>;

    async fn content(&self, hash: &str) -> Result<Option<String>>;

    /// Diff stored for a non-duplicate snapshot.
    async fn diff(&self, snapshot: Uuid) -> Result<Option<Diff>>;
}
