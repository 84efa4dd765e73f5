//! Minute-driven trigger loop for enabled jobs.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::inventory::Inventory;
use crate::model::{JobDefinition, JobId};
use crate::run::JobRun;
use crate::schedule::{Schedule, truncate_to_minute};

/// Fires due jobs on a [`Dispatcher`].
///
/// The scheduler remembers the minute each job last fired in, so a job is
/// never triggered twice for the same minute even if [`Scheduler::tick`] is
/// called more than once within it.
pub struct Scheduler {
    dispatcher: Dispatcher,
    inventory: Arc<dyn Inventory>,
    fired: Mutex<HashMap<JobId, DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(dispatcher: Dispatcher, inventory: Arc<dyn Inventory>) -> Self {
        Self {
            dispatcher,
            inventory,
            fired: Mutex::new(HashMap::new()),
        }
    }

    /// Enabled jobs whose schedule matches the minute of `at` and that have
    /// not fired in that minute yet. Jobs with unparsable schedules are
    /// logged and skipped.
    pub async fn due_jobs(&self, at: DateTime<Utc>) -> Result<Vec<JobDefinition>> {
        let minute = truncate_to_minute(at);
        let fired = self.fired.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut due = Vec::new();
        for job in self.inventory.jobs().await? {
            if !job.enabled {
                continue;
            }
            let schedule = match Schedule::parse(&job.schedule) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Job {} has an invalid schedule: {e}", job.id);
                    continue;
                }
            };
            if schedule.is_due(minute) && fired.get(&job.id) != Some(&minute) {
                due.push(job);
            }
        }
        Ok(due)
    }

    /// Starts a run for every due job. Each run gets a child of `shutdown`
    /// so cancelling the scheduler cancels its runs.
    pub async fn tick(
        &self,
        at: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<Vec<JoinHandle<Result<JobRun>>>> {
        let minute = truncate_to_minute(at);
        let mut handles = Vec::new();
        for job in self.due_jobs(at).await? {
            {
                let mut fired = self.fired.lock().unwrap_or_else(|p| p.into_inner());
                if fired.get(&job.id) == Some(&minute) {
                    continue;
                }
                fired.insert(job.id.clone(), minute);
            }
            info!("Job {} is due at {minute}", job.id);
            let dispatcher = self.dispatcher.clone();
            let cancel = shutdown.child_token();
            handles.push(tokio::spawn(async move {
                dispatcher.run_definition(&job, cancel).await
            }));
        }
        Ok(handles)
    }

    /// Ticks at every minute boundary until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Scheduler started");
        loop {
            let now = Utc::now();
            let next = truncate_to_minute(now) + chrono::Duration::minutes(1);
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            match self.tick(Utc::now(), &shutdown).await {
                Ok(handles) if !handles.is_empty() => {
                    debug!("Started {} job run(s)", handles.len())
                }
                Ok(_) => {}
                Err(e) => error!("Scheduler tick failed: {e}"),
            }
        }
    }
}
