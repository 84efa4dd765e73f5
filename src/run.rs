//! Job runs, their aggregate status and the tracker the admin surface reads.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::model::{DeviceId, JobId};
use crate::snapshot::DiffSummary;
use crate::task::{Task, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
}

impl JobRunStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobRunStatus::Completed | JobRunStatus::CompletedWithFailures | JobRunStatus::Failed
        )
    }
}

/// One execution of a job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job: JobId,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobRunStatus,
    pub cancelled: bool,
    /// One task per resolved device, ordered by device name.
    pub tasks: Vec<Task>,
}

impl JobRun {
    pub fn new(job: JobId, job_name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            job_name: job_name.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: JobRunStatus::Pending,
            cancelled: false,
            tasks,
        }
    }

    /// Aggregate status of the terminal tasks.
    ///
    /// An empty run is `Completed`. A run in which no task succeeded is
    /// `Failed`; one with any failed task is `CompletedWithFailures`.
    pub fn aggregate_status(&self) -> JobRunStatus {
        if self.tasks.is_empty() {
            return JobRunStatus::Completed;
        }
        let succeeded = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Succeeded)
            .count();
        if succeeded == 0 {
            JobRunStatus::Failed
        } else if self.tasks.iter().any(Task::is_failed) {
            JobRunStatus::CompletedWithFailures
        } else {
            JobRunStatus::Completed
        }
    }

    pub fn finish(&mut self) {
        self.status = self.aggregate_status();
        self.finished_at = Some(Utc::now());
    }

    pub fn task(&self, device: &DeviceId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.device == device)
    }

    pub fn progress(&self) -> RunProgress {
        let mut progress = RunProgress {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in &self.tasks {
            match task.state {
                TaskState::Pending => progress.pending += 1,
                TaskState::Succeeded => progress.succeeded += 1,
                TaskState::Failed => progress.failed += 1,
                TaskState::Skipped => progress.skipped += 1,
                _ => progress.in_flight += 1,
            }
        }
        progress
    }

    /// Completion report for the notification collaborator.
    pub fn report(&self) -> RunReport {
        let changes = self
            .tasks
            .iter()
            .filter(|t| t.changed)
            .map(|t| ChangeEntry {
                device: t.device.clone(),
                old_hash: t.old_hash.clone(),
                new_hash: t.new_hash.clone().unwrap_or_default(),
                diff_summary: t.diff_summary.unwrap_or_default(),
            })
            .collect();
        let failures = self
            .tasks
            .iter()
            .filter_map(|t| match (t.state, &t.error, t.skip_reason) {
                (TaskState::Failed, Some(err), _) => Some(FailureEntry {
                    device: t.device.clone(),
                    error_kind: err.kind,
                    detail: err.detail.clone(),
                }),
                (TaskState::Skipped, _, Some(reason)) => Some(FailureEntry {
                    device: t.device.clone(),
                    error_kind: reason.kind(),
                    detail: format!("skipped: {}", reason.kind()),
                }),
                _ => None,
            })
            .collect();
        RunReport {
            run: self.id,
            job: self.job.clone(),
            status: self.status,
            cancelled: self.cancelled,
            started_at: self.started_at,
            finished_at: self.finished_at,
            progress: self.progress(),
            changes,
            failures,
        }
    }
}

/// Task counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunProgress {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunProgress {
    pub fn done(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// A device whose configuration changed against its baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub device: DeviceId,
    pub old_hash: Option<String>,
    pub new_hash: String,
    pub diff_summary: DiffSummary,
}

/// A device whose task failed or was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub device: DeviceId,
    pub error_kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run: Uuid,
    pub job: JobId,
    pub status: JobRunStatus,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: RunProgress,
    pub changes: Vec<ChangeEntry>,
    pub failures: Vec<FailureEntry>,
}

/// Events published by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchEvent {
    RunStarted {
        run: Uuid,
        job: JobId,
        tasks: usize,
    },
    TaskFinished {
        run: Uuid,
        task: Task,
    },
    RunCompleted(RunReport),
}

/// Shared, queryable record of job runs.
#[derive(Debug, Clone, Default)]
pub struct RunTracker {
    runs: Arc<RwLock<HashMap<Uuid, JobRun>>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run: JobRun) {
        self.runs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run.id, run);
    }

    /// Applies `f` to a run in place; returns its result if the run exists.
    pub fn update<R>(&self, run: Uuid, f: impl FnOnce(&mut JobRun) -> R) -> Option<R> {
        self.runs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&run)
            .map(f)
    }

    pub fn update_task(&self, run: Uuid, index: usize, task: &Task) {
        self.update(run, |r| {
            if let Some(slot) = r.tasks.get_mut(index) {
                *slot = task.clone();
            }
        });
    }

    pub fn get(&self, run: Uuid) -> Option<JobRun> {
        self.runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&run)
            .cloned()
    }

    /// All runs, newest first.
    pub fn runs(&self) -> Vec<JobRun> {
        let mut runs: Vec<JobRun> = self
            .runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    pub fn runs_for_job(&self, job: &JobId) -> Vec<JobRun> {
        self.runs().into_iter().filter(|r| &r.job == job).collect()
    }

    pub fn progress(&self, run: Uuid) -> Option<RunProgress> {
        self.runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&run)
            .map(JobRun::progress)
    }

    /// Runs that have not reached a final status.
    pub fn active(&self) -> Vec<Uuid> {
        self.runs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|r| !r.status.is_finished())
            .map(|r| r.id)
            .collect()
    }
}
