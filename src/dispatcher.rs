//! Job expansion and concurrent task execution.
//!
//! A [`Dispatcher`] turns one job definition into a [`JobRun`]: it resolves
//! the target devices, creates one [`Task`] per device and runs the tasks on
//! a bounded worker pool. Each worker takes a pool slot, then the device
//! lease, then runs attempts until the task succeeds, fails fatally or runs
//! out of retry budget.
//!
//! The lease map is shared by every run of the same dispatcher, so two
//! overlapping runs never work on the same device at once; the loser skips
//! the device with [`SkipReason::DeviceBusy`].

use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::{CaptureEngine, CapturePayload};
use crate::config::{EngineConfig, TimeoutConfig};
use crate::credential::CredentialStore;
use crate::driver::DriverRegistry;
use crate::error::{BackupError, ErrorKind, Result};
use crate::inventory::Inventory;
use crate::lease::LeaseMap;
use crate::model::{CaptureOptions, DeviceRef, JobDefinition, JobId};
use crate::run::{DispatchEvent, JobRun, JobRunStatus, RunTracker};
use crate::session::{ConnectionManager, ConnectionSecurityOptions, SessionRequest};
use crate::snapshot::{ChangeDetector, Recorded, SnapshotStore};
use crate::task::{RetryPolicy, SkipReason, Task, TaskState};

/// How long a finished run waits for room in the event channel.
const COMPLETION_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

struct Inner {
    config: EngineConfig,
    inventory: Arc<dyn Inventory>,
    credentials: Arc<dyn CredentialStore>,
    connections: ConnectionManager,
    drivers: DriverRegistry,
    detector: ChangeDetector,
    leases: LeaseMap,
    tracker: RunTracker,
    events: mpsc::Sender<DispatchEvent>,
}

/// Runs jobs. Cheap to clone; clones share leases, tracker and events.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Everything one worker needs for its task.
struct Work {
    run: Uuid,
    index: usize,
    device: DeviceRef,
    options: CaptureOptions,
    timeouts: TimeoutConfig,
    policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Creates a dispatcher and the receiving end of its event channel.
    pub fn new(
        config: EngineConfig,
        inventory: Arc<dyn Inventory>,
        credentials: Arc<dyn CredentialStore>,
        connections: ConnectionManager,
        drivers: DriverRegistry,
        detector: ChangeDetector,
    ) -> (Self, mpsc::Receiver<DispatchEvent>) {
        let (events, rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let inner = Inner {
            config,
            inventory,
            credentials,
            connections,
            drivers,
            detector,
            leases: LeaseMap::new(),
            tracker: RunTracker::new(),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Dispatcher for real devices, wired from configuration.
    pub fn from_config(
        config: EngineConfig,
        inventory: Arc<dyn Inventory>,
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<(Self, mpsc::Receiver<DispatchEvent>)> {
        config.validate()?;
        let drivers = DriverRegistry::from_overrides(&config.vendors)?;
        let connections = ConnectionManager::network(ConnectionSecurityOptions::from_config(
            config.security_level,
            config.check_host_keys,
        ));
        let detector = ChangeDetector::new(store, config.diff_cache_capacity);
        Ok(Self::new(
            config,
            inventory,
            credentials,
            connections,
            drivers,
            detector,
        ))
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.inner.tracker
    }

    pub fn leases(&self) -> &LeaseMap {
        &self.inner.leases
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.inner.detector
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Loads a job from the inventory and runs it to completion.
    pub async fn run_job(&self, job: &JobId, cancel: CancellationToken) -> Result<JobRun> {
        let definition = self
            .inner
            .inventory
            .job(job)
            .await?
            .ok_or_else(|| BackupError::JobNotFound(job.to_string()))?;
        self.run_definition(&definition, cancel).await
    }

    /// Runs a job definition to completion and returns the finished run.
    ///
    /// Fails only when the job cannot be expanded; per-device failures are
    /// recorded on the tasks.
    pub async fn run_definition(
        &self,
        job: &JobDefinition,
        cancel: CancellationToken,
    ) -> Result<JobRun> {
        let inner = &self.inner;
        let timeouts = match &job.options.timeouts {
            Some(t) => {
                t.validate()?;
                t.clone()
            }
            None => inner.config.timeouts.clone(),
        };
        let devices = self.expand(job).await?;
        let concurrency = inner.config.effective_concurrency(job.options.concurrency);

        let tasks = devices.iter().map(|d| Task::new(d)).collect();
        let mut run = JobRun::new(job.id.clone(), job.name.clone(), tasks);
        run.status = JobRunStatus::Running;
        let run_id = run.id;
        inner.tracker.insert(run.clone());
        info!(
            "Run {run_id} of job {} started: {} devices, concurrency {concurrency}",
            job.id,
            devices.len()
        );
        self.publish(DispatchEvent::RunStarted {
            run: run_id,
            job: job.id.clone(),
            tasks: devices.len(),
        });

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let policy = RetryPolicy::new(&inner.config.retry, job.options.max_retries);
        let mut workers = JoinSet::new();
        for (index, device) in devices.iter().enumerate() {
            let work = Work {
                run: run_id,
                index,
                device: device.clone(),
                options: job.options.clone(),
                timeouts: timeouts.clone(),
                policy: policy.clone(),
                semaphore: semaphore.clone(),
                cancel: cancel.clone(),
            };
            let this = self.clone();
            workers.spawn(async move {
                let index = work.index;
                (index, this.run_task(work).await)
            });
        }

        let mut finished: Vec<Option<Task>> = vec![None; devices.len()];
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, task)) => {
                    if let Some(slot) = finished.get_mut(index) {
                        *slot = Some(task);
                    }
                }
                Err(e) => error!("Run {run_id}: worker aborted: {e}"),
            }
        }

        for (index, slot) in finished.into_iter().enumerate() {
            let task = match slot {
                Some(task) => task,
                None => {
                    let mut task = inner
                        .tracker
                        .get(run_id)
                        .and_then(|r| r.tasks.get(index).cloned())
                        .unwrap_or_else(|| run.tasks[index].clone());
                    task.attempt_failed(
                        &BackupError::ProtocolError("worker aborted".to_string()),
                        false,
                    );
                    task
                }
            };
            run.tasks[index] = task;
        }
        run.cancelled = cancel.is_cancelled();
        run.finish();
        inner.tracker.insert(run.clone());

        let report = run.report();
        info!(
            "Run {run_id} of job {} finished {:?}: {} changed, {} failed",
            job.id,
            run.status,
            report.changes.len(),
            report.failures.len()
        );
        let completed = inner.events.send(DispatchEvent::RunCompleted(report));
        match tokio::time::timeout(COMPLETION_SEND_TIMEOUT, completed).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Run {run_id}: no event receiver"),
            Err(_) => warn!("Run {run_id}: event receiver is not draining, completion event dropped"),
        }
        Ok(run)
    }

    /// Resolves the job's devices and groups into a de-duplicated list of
    /// active devices ordered by name. Unknown and inactive devices are
    /// dropped with a log line.
    async fn expand(&self, job: &JobDefinition) -> Result<Vec<DeviceRef>> {
        let inventory = &self.inner.inventory;
        let mut ids = job.devices.clone();
        for group_id in &job.groups {
            match inventory.group(group_id).await? {
                Some(group) => ids.extend(group.devices),
                None => warn!("Job {}: unknown group {group_id}", job.id),
            }
        }

        let mut seen = HashSet::new();
        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            match inventory.device(&id).await? {
                Some(device) if device.active => devices.push(device),
                Some(_) => debug!("Job {}: device {id} is inactive", job.id),
                None => warn!("Job {}: unknown device {id}", job.id),
            }
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(devices)
    }

    fn publish(&self, event: DispatchEvent) {
        // Progress events are advisory; a slow consumer must not stall workers.
        if let Err(mpsc::error::TrySendError::Full(_)) = self.inner.events.try_send(event) {
            debug!("Event channel full, dropping progress event");
        }
    }

    fn checkpoint(&self, work: &Work, task: &Task) {
        self.inner.tracker.update_task(work.run, work.index, task);
    }

    async fn run_task(&self, work: Work) -> Task {
        let mut task = Task::new(&work.device);
        self.drive(&work, &mut task).await;
        self.checkpoint(&work, &task);
        self.publish(DispatchEvent::TaskFinished {
            run: work.run,
            task: task.clone(),
        });
        task
    }

    /// Runs the task to a terminal state.
    async fn drive(&self, work: &Work, task: &mut Task) {
        let device = &work.device;

        let permit = tokio::select! {
            biased;
            _ = work.cancel.cancelled() => None,
            permit = work.semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            debug!("{}: cancelled while queued", device.id);
            task.skip(SkipReason::Cancelled);
            return;
        };
        if work.cancel.is_cancelled() {
            task.skip(SkipReason::Cancelled);
            return;
        }

        let Some(_lease) = self.inner.leases.try_acquire(&device.id) else {
            warn!("{}: another run holds the device, skipping", device.id);
            task.skip(SkipReason::DeviceBusy);
            return;
        };

        let mut failures: Vec<ErrorKind> = Vec::new();
        loop {
            task.begin_attempt();
            self.checkpoint(work, task);

            let err = match self.attempt(work, task).await {
                Ok(recorded) => {
                    task.succeed(&recorded);
                    debug!(
                        "{}: snapshot {} recorded after {} attempt(s)",
                        device.id, recorded.snapshot.id, task.attempts
                    );
                    return;
                }
                Err(err) => err,
            };

            failures.push(err.kind());
            let retry = if work.cancel.is_cancelled() {
                None
            } else {
                work.policy.decide(task.attempts, &failures)
            };
            task.attempt_failed(&err, retry.is_some());
            self.checkpoint(work, task);

            let Some(delay) = retry else {
                error!(
                    "{}: attempt {} failed, giving up: {err}",
                    device.id, task.attempts
                );
                return;
            };
            warn!(
                "{}: attempt {} failed ({err}), retrying in {:?}",
                device.id, task.attempts, delay
            );
            tokio::select! {
                _ = work.cancel.cancelled() => {
                    debug!("{}: run cancelled during backoff", device.id);
                    task.enter(TaskState::Failed);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt: capture within the session timeout, then persist within
    /// the storage timeout. The device lease is held by the caller.
    async fn attempt(&self, work: &Work, task: &mut Task) -> Result<Recorded> {
        let session_timeout = work.timeouts.session();
        let payload = match tokio::time::timeout(session_timeout, self.capture(work, task)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackupError::SessionTimeout(format!(
                    "{} exceeded {}s",
                    work.device.id,
                    session_timeout.as_secs()
                )));
            }
        };

        task.enter(TaskState::Persisting);
        self.checkpoint(work, task);
        let storage_timeout = work.timeouts.storage();
        let detector = &self.inner.detector;
        let device = &work.device.id;
        let mut recorded = match tokio::time::timeout(
            storage_timeout,
            detector.record(device, &payload),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackupError::StorageError(format!(
                    "persisting snapshot of {device} exceeded {}s",
                    storage_timeout.as_secs()
                )));
            }
        };

        // The configuration snapshot is already durable; additional output
        // that fails to persist is logged and the attempt still succeeds.
        if payload.additional.is_some() {
            match tokio::time::timeout(storage_timeout, detector.record_additional(device, &payload))
                .await
            {
                Ok(Ok(extra)) => recorded.additional = extra.map(Box::new),
                Ok(Err(e)) => warn!("{device}: additional output not persisted: {e}"),
                Err(_) => warn!(
                    "{device}: persisting additional output exceeded {}s",
                    storage_timeout.as_secs()
                ),
            }
        }
        Ok(recorded)
    }

    async fn capture(&self, work: &Work, task: &mut Task) -> Result<CapturePayload> {
        let inner = &self.inner;
        let device = &work.device;
        let driver = inner.drivers.driver_for(&device.vendor, &work.options)?;

        let credential = inner
            .credentials
            .decrypt(&device.credential_profile)
            .await
            .map_err(|e| match e {
                BackupError::AuthFailed(_) => e,
                other => BackupError::AuthFailed(format!(
                    "credential profile {}: {}",
                    device.credential_profile,
                    other.detail()
                )),
            })?;
        let escalation = driver.escalation_command(&credential)?;

        let request = SessionRequest::new(
            device.clone(),
            credential,
            driver.prompt_handler(),
            work.timeouts.clone(),
        );
        let mut session = inner.connections.open(request).await?;

        task.enter(TaskState::Capturing);
        self.checkpoint(work, task);
        let engine = CaptureEngine::new(work.timeouts.command());
        let result = engine
            .capture(session.as_mut(), &driver, escalation.as_deref())
            .await;
        session.close().await;
        result
    }
}
