//! Per-device unit of work within a job run.
//!
//! A task moves through
//! `Pending -> Connecting -> Capturing -> Persisting -> Succeeded`, may
//! detour through `Retrying` back to `Connecting`, and ends in `Failed` or
//! `Skipped` otherwise. Only the worker that owns a task mutates it; a task
//! is immutable once terminal.

use chrono::{DateTime, Utc};
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::{RetryBackoff, RetryConfig};
use crate::error::{BackupError, ErrorKind};
use crate::model::{Device, DeviceId};
use crate::snapshot::{DiffSummary, Recorded};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Connecting,
    Capturing,
    Persisting,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, Connecting | Skipped | Failed) => true,
            (Connecting, Capturing | Retrying | Failed) => true,
            (Capturing, Persisting | Retrying | Failed) => true,
            (Persisting, Succeeded | Retrying | Failed) => true,
            (Retrying, Connecting | Failed) => true,
            _ => false,
        }
    }
}

/// Why a task never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another task held the device lease.
    DeviceBusy,
    /// The run was cancelled while the task was queued.
    Cancelled,
}

impl SkipReason {
    pub fn kind(self) -> ErrorKind {
        match self {
            SkipReason::DeviceBusy => ErrorKind::DeviceBusy,
            SkipReason::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Error recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&BackupError> for TaskError {
    fn from(err: &BackupError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.detail().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub device: DeviceId,
    pub device_name: String,
    pub vendor: String,
    pub state: TaskState,
    /// Connection attempts started so far.
    pub attempts: u32,
    pub snapshot: Option<Uuid>,
    pub changed: bool,
    pub duplicate: bool,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub diff_summary: Option<DiffSummary>,
    /// Snapshot of the additional show command output, if captured.
    #[serde(default)]
    pub additional_snapshot: Option<Uuid>,
    #[serde(default)]
    pub additional_changed: bool,
    pub error: Option<TaskError>,
    pub skip_reason: Option<SkipReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.id.clone(),
            device_name: device.name.clone(),
            vendor: device.vendor.clone(),
            state: TaskState::Pending,
            attempts: 0,
            snapshot: None,
            changed: false,
            duplicate: false,
            old_hash: None,
            new_hash: None,
            diff_summary: None,
            additional_snapshot: None,
            additional_changed: false,
            error: None,
            skip_reason: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves to `next`. Illegal transitions are logged and ignored.
    pub fn enter(&mut self, next: TaskState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "{}: ignoring task transition {:?} -> {:?}",
                self.device, self.state, next
            );
            return false;
        }
        if self.state == TaskState::Pending {
            self.started_at = Some(Utc::now());
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    /// Starts a new connection attempt.
    pub fn begin_attempt(&mut self) -> bool {
        if self.enter(TaskState::Connecting) {
            self.attempts += 1;
            true
        } else {
            false
        }
    }

    pub fn succeed(&mut self, recorded: &Recorded) {
        self.snapshot = Some(recorded.snapshot.id);
        self.duplicate = recorded.snapshot.is_duplicate();
        self.changed = recorded.changed;
        self.old_hash = recorded.old_hash.clone();
        self.new_hash = Some(recorded.snapshot.hash.clone());
        self.diff_summary = recorded.diff.as_ref().map(|d| d.summary);
        if let Some(extra) = recorded.additional.as_deref() {
            self.additional_snapshot = Some(extra.snapshot.id);
            self.additional_changed = extra.changed;
        }
        self.error = None;
        self.enter(TaskState::Succeeded);
    }

    /// Records an attempt failure; the task becomes `Retrying` or `Failed`.
    pub fn attempt_failed(&mut self, err: &BackupError, retry: bool) {
        self.error = Some(TaskError::from(err));
        self.enter(if retry {
            TaskState::Retrying
        } else {
            TaskState::Failed
        });
    }

    pub fn skip(&mut self, reason: SkipReason) {
        self.skip_reason = Some(reason);
        self.enter(TaskState::Skipped);
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Failed outright, as opposed to skipped.
    pub fn is_failed(&self) -> bool {
        self.state == TaskState::Failed
    }
}

/// Retry decision for failed attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: RetryBackoff,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig, override_retries: Option<u32>) -> Self {
        Self {
            max_retries: override_retries.unwrap_or(config.max_retries),
            backoff: config.backoff,
        }
    }

    /// Delay before the next attempt, or `None` when the task should fail.
    ///
    /// `attempt` is the 1-based attempt that just failed and `failures`
    /// holds the kinds of every failed attempt so far, including this one.
    /// Fatal kinds are never retried; a protocol error is retried once.
    pub fn decide(&self, attempt: u32, failures: &[ErrorKind]) -> Option<Duration> {
        let kind = *failures.last()?;
        if !kind.is_transient() || attempt > self.max_retries {
            return None;
        }
        if kind == ErrorKind::ProtocolError
            && failures
                .iter()
                .filter(|k| **k == ErrorKind::ProtocolError)
                .count()
                > 1
        {
            return None;
        }
        Some(self.backoff.delay(attempt))
    }
}
