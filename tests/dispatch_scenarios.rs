use netsnap::config::{EngineConfig, RetryBackoff, TimeoutConfig, VendorOverride};
use netsnap::credential::{CredentialView, StaticCredentialStore};
use netsnap::dispatcher::Dispatcher;
use netsnap::driver::DriverRegistry;
use netsnap::error::{BackupError, ErrorKind};
use netsnap::inventory::MemoryInventory;
use netsnap::model::{CaptureOptions, Device, DeviceId, JobDefinition, JobId};
use netsnap::run::{DispatchEvent, JobRunStatus};
use netsnap::session::{ConnectionManager, DeviceScript, ReplayConnector};
use netsnap::snapshot::{ChangeDetector, MemorySnapshotStore, SnapshotStore, additional_stream};
use netsnap::task::{SkipReason, TaskState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

const SHOW_RUN: &str = "show running-config";

struct Harness {
    dispatcher: Dispatcher,
    events: Receiver<DispatchEvent>,
    replay: ReplayConnector,
    inventory: Arc<MemoryInventory>,
    store: Arc<MemorySnapshotStore>,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(tune: impl FnOnce(&mut EngineConfig)) -> Harness {
    let mut config = EngineConfig::default();
    config.retry.backoff = RetryBackoff::Fixed { delay_ms: 1 };
    tune(&mut config);

    let inventory = Arc::new(MemoryInventory::new());
    let credentials =
        Arc::new(StaticCredentialStore::new().with("ro", CredentialView::new("backup", "pw")));
    let replay = ReplayConnector::new();
    let store = Arc::new(MemorySnapshotStore::new());
    let drivers = DriverRegistry::from_overrides(&config.vendors).expect("registry");
    let (dispatcher, events) = Dispatcher::new(
        config,
        inventory.clone(),
        credentials,
        ConnectionManager::new(Arc::new(replay.clone())),
        drivers,
        ChangeDetector::new(store.clone(), 64),
    );
    Harness {
        dispatcher,
        events,
        replay,
        inventory,
        store,
    }
}

fn generic(id: &str) -> Device {
    Device::new(id, format!("10.0.0.{}", id.len()), "generic", "ro")
}

fn show_run_options() -> CaptureOptions {
    CaptureOptions {
        commands: vec![SHOW_RUN.to_string()],
        ..Default::default()
    }
}

fn job(devices: &[&str]) -> JobDefinition {
    JobDefinition::new("nightly", "Nightly")
        .with_devices(devices.iter().copied())
        .with_options(show_run_options())
}

#[tokio::test]
async fn changed_failed_and_duplicate_devices_are_reported() {
    let h = harness();
    h.inventory.add_device(generic("a"));
    h.inventory
        .add_device(Device::new("b", "10.0.0.2", "generic", "missing-profile"));
    h.inventory.add_device(generic("c"));
    h.replay
        .script("a", DeviceScript::new().respond(SHOW_RUN, "hostname a\nv1"));
    h.replay
        .script("c", DeviceScript::new().respond(SHOW_RUN, "hostname c"));
    let job = job(&["a", "b", "c"]);

    let first = h
        .dispatcher
        .run_definition(&job, CancellationToken::new())
        .await
        .expect("first run");
    assert_eq!(first.status, JobRunStatus::CompletedWithFailures);
    assert!(first.report().changes.is_empty(), "first captures are baselines");

    h.replay
        .push_response(&DeviceId::from("a"), SHOW_RUN, "hostname a\nv2");
    let second = h
        .dispatcher
        .run_definition(&job, CancellationToken::new())
        .await
        .expect("second run");

    assert_eq!(second.status, JobRunStatus::CompletedWithFailures);
    let report = second.report();
    let changed: Vec<&str> = report.changes.iter().map(|c| c.device.as_str()).collect();
    let failed: Vec<&str> = report.failures.iter().map(|f| f.device.as_str()).collect();
    assert_eq!(changed, vec!["a"]);
    assert_eq!(failed, vec!["b"]);
    assert_eq!(report.failures[0].error_kind, ErrorKind::AuthFailed);
    assert_eq!(report.changes[0].diff_summary.added, 1);
    assert_eq!(report.changes[0].diff_summary.removed, 1);

    let c = second.task(&DeviceId::from("c")).expect("task c");
    assert!(c.duplicate);
    assert!(!c.changed);

    // credential decryption fails before any network call
    let b = second.task(&DeviceId::from("b")).expect("task b");
    assert_eq!(b.attempts, 1);
    assert_eq!(h.replay.connect_attempts(&DeviceId::from("b")), 0);
}

#[tokio::test]
async fn overlapping_groups_yield_one_task_per_device() {
    let h = harness();
    for id in ["a", "b", "c", "d"] {
        h.inventory.add_device(generic(id).with_name(format!("node-{id}")));
        h.replay
            .script(id, DeviceScript::new().respond(SHOW_RUN, &format!("hostname {id}")));
    }
    let mut inactive = generic("e");
    inactive.active = false;
    h.inventory.add_device(inactive);
    h.inventory.add_group("core", ["a", "b"]);
    h.inventory.add_group("edge", ["b", "c", "e", "ghost"]);

    let job = JobDefinition::new("grouped", "Grouped")
        .with_devices(["c", "d"])
        .with_groups(["core", "edge", "unknown-group"])
        .with_options(show_run_options());
    let run = h
        .dispatcher
        .run_definition(&job, CancellationToken::new())
        .await
        .expect("run");

    let devices: Vec<&str> = run.tasks.iter().map(|t| t.device.as_str()).collect();
    assert_eq!(devices, vec!["a", "b", "c", "d"]);
    assert_eq!(run.status, JobRunStatus::Completed);
}

#[tokio::test]
async fn empty_job_completes_without_tasks() {
    let mut h = harness();
    let run = h
        .dispatcher
        .run_definition(&job(&[]), CancellationToken::new())
        .await
        .expect("run");
    assert!(run.tasks.is_empty());
    assert_eq!(run.status, JobRunStatus::Completed);

    let mut completed = false;
    while let Ok(event) = h.events.try_recv() {
        if let DispatchEvent::RunCompleted(report) = event {
            assert_eq!(report.run, run.id);
            completed = true;
        }
    }
    assert!(completed);
}

#[tokio::test]
async fn unknown_job_is_job_not_found() {
    let h = harness();
    let err = h
        .dispatcher
        .run_job(&JobId::from("nope"), CancellationToken::new())
        .await
        .expect_err("missing job");
    assert_eq!(err.kind(), ErrorKind::JobNotFound);
}

#[tokio::test]
async fn connect_timeout_is_retried_until_budget_is_spent() {
    let h = harness();
    h.inventory.add_device(generic("slow"));
    let mut script = DeviceScript::new();
    for _ in 0..5 {
        script = script.fail_connect(netsnap::error::BackupError::ConnectTimeout(
            "no answer".to_string(),
        ));
    }
    h.replay.script("slow", script);

    let run = h
        .dispatcher
        .run_definition(&job(&["slow"]), CancellationToken::new())
        .await
        .expect("run");
    let task = &run.tasks[0];
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.error.as_ref().map(|e| e.kind), Some(ErrorKind::ConnectTimeout));
    assert_eq!(h.replay.connect_attempts(&DeviceId::from("slow")), 3);
    assert_eq!(run.status, JobRunStatus::Failed);
}

#[tokio::test]
async fn job_level_retry_override_applies() {
    let h = harness();
    h.inventory.add_device(generic("slow"));
    h.replay.script(
        "slow",
        DeviceScript::new()
            .fail_connect(netsnap::error::BackupError::ConnectRefused("rst".to_string()))
            .fail_connect(netsnap::error::BackupError::ConnectRefused("rst".to_string())),
    );
    let mut job = job(&["slow"]);
    job.options.max_retries = Some(0);

    let run = h
        .dispatcher
        .run_definition(&job, CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(run.tasks[0].attempts, 1);
    assert_eq!(
        run.tasks[0].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::ConnectRefused)
    );
}

#[tokio::test]
async fn storage_failure_retries_as_new_attempt() {
    let h = harness();
    h.inventory.add_device(generic("r1"));
    h.replay
        .script("r1", DeviceScript::new().respond(SHOW_RUN, "hostname r1"));
    h.store.fail_next_appends(1);

    let run = h
        .dispatcher
        .run_definition(&job(&["r1"]), CancellationToken::new())
        .await
        .expect("run");
    let task = &run.tasks[0];
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempts, 2);
    let history = h.store.history(&DeviceId::from("r1")).await.expect("history");
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn unknown_vendor_fails_without_retry() {
    let h = harness();
    h.inventory
        .add_device(Device::new("x", "10.0.0.9", "acme_os", "ro"));
    let run = h
        .dispatcher
        .run_definition(&job(&["x"]), CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(run.tasks[0].attempts, 1);
    assert_eq!(
        run.tasks[0].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::UnsupportedCommand)
    );
}

#[tokio::test]
async fn concurrent_runs_on_one_device_skip_the_loser() {
    let h = harness();
    h.inventory.add_device(generic("d"));
    h.replay.script(
        "d",
        DeviceScript::new()
            .respond(SHOW_RUN, "hostname d")
            .with_command_delay(Duration::from_millis(200)),
    );
    let job = job(&["d"]);

    let (first, second) = tokio::join!(
        h.dispatcher.run_definition(&job, CancellationToken::new()),
        h.dispatcher.run_definition(&job, CancellationToken::new()),
    );
    let runs = [first.expect("first"), second.expect("second")];

    let succeeded = runs
        .iter()
        .filter(|r| r.tasks[0].state == TaskState::Succeeded)
        .count();
    let busy: Vec<_> = runs
        .iter()
        .filter(|r| r.tasks[0].skip_reason == Some(SkipReason::DeviceBusy))
        .collect();
    assert_eq!(succeeded, 1);
    assert_eq!(busy.len(), 1);
    assert_eq!(busy[0].status, JobRunStatus::Failed);
    assert_eq!(busy[0].tasks[0].attempts, 0);
    assert_eq!(h.replay.max_in_flight(&DeviceId::from("d")), 1);
    assert_eq!(h.replay.connect_attempts(&DeviceId::from("d")), 1);
    assert!(!h.dispatcher.leases().is_held(&DeviceId::from("d")));
}

#[tokio::test]
async fn concurrency_limit_bounds_open_sessions() {
    let h = harness();
    let ids: Vec<String> = (0..8).map(|i| format!("n{i}")).collect();
    for id in &ids {
        h.inventory.add_device(generic(id));
        h.replay.script(
            id.as_str(),
            DeviceScript::new()
                .respond(SHOW_RUN, &format!("hostname {id}"))
                .with_command_delay(Duration::from_millis(20)),
        );
    }
    let mut job = JobDefinition::new("wide", "Wide")
        .with_devices(ids.iter().cloned())
        .with_options(show_run_options());
    job.options.concurrency = Some(3);

    let run = h
        .dispatcher
        .run_definition(&job, CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(run.tasks.len(), 8);
    assert_eq!(run.status, JobRunStatus::Completed);
    assert!(h.replay.max_in_flight_total() <= 3);
}

#[tokio::test]
async fn cancellation_skips_queued_tasks_and_lets_in_flight_finish() {
    let h = harness();
    let ids = ["a", "b", "c", "d"];
    for id in ids {
        h.inventory.add_device(generic(id));
        h.replay.script(
            id,
            DeviceScript::new()
                .respond(SHOW_RUN, &format!("hostname {id}"))
                .with_command_delay(Duration::from_millis(150)),
        );
    }
    let mut job = job(&ids);
    job.options.concurrency = Some(1);

    let cancel = CancellationToken::new();
    let dispatcher = h.dispatcher.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { dispatcher.run_definition(&job, token).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let run = handle.await.expect("join").expect("run");

    assert!(run.cancelled);
    let succeeded: Vec<_> = run
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Succeeded)
        .collect();
    let skipped = run
        .tasks
        .iter()
        .filter(|t| t.skip_reason == Some(SkipReason::Cancelled))
        .count();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(skipped, 3);

    // only the finished device has a snapshot, and it is complete
    for task in &run.tasks {
        let history = h.store.history(&task.device).await.expect("history");
        if task.state == TaskState::Succeeded {
            assert_eq!(history.len(), 1);
            let content = h
                .store
                .content(&history[0].hash)
                .await
                .expect("content");
            assert!(content.is_some());
        } else {
            assert!(history.is_empty());
        }
    }
}

#[tokio::test]
async fn events_follow_run_lifecycle() {
    let mut h = harness();
    h.inventory.add_device(generic("a"));
    h.replay
        .script("a", DeviceScript::new().respond(SHOW_RUN, "hostname a"));
    let run = h
        .dispatcher
        .run_definition(&job(&["a"]), CancellationToken::new())
        .await
        .expect("run");

    let mut kinds = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        kinds.push(match event {
            DispatchEvent::RunStarted { run: id, tasks, .. } => {
                assert_eq!(id, run.id);
                assert_eq!(tasks, 1);
                "started"
            }
            DispatchEvent::TaskFinished { task, .. } => {
                assert_eq!(task.state, TaskState::Succeeded);
                "task"
            }
            DispatchEvent::RunCompleted(_) => "completed",
        });
    }
    assert_eq!(kinds, vec!["started", "task", "completed"]);
    assert_eq!(
        h.dispatcher.tracker().get(run.id).map(|r| r.status),
        Some(JobRunStatus::Completed)
    );
}

#[tokio::test]
async fn invalid_job_timeouts_are_rejected() {
    let h = harness();
    h.inventory.add_device(generic("r1"));
    let mut job = job(&["r1"]);
    job.options.timeouts = Some(TimeoutConfig {
        command_secs: 0,
        ..Default::default()
    });

    let err = h
        .dispatcher
        .run_definition(&job, CancellationToken::new())
        .await
        .expect_err("zero timeout");
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert_eq!(h.replay.connect_attempts(&DeviceId::from("r1")), 0);
}

#[tokio::test(start_paused = true)]
async fn session_timeout_is_retried_until_budget_is_spent() {
    let h = harness();
    h.inventory.add_device(generic("slow"));
    h.replay.script(
        "slow",
        DeviceScript::new()
            .respond("show version", "v1")
            .respond("show interfaces", "eth0")
            .respond(SHOW_RUN, "hostname slow")
            .with_command_delay(Duration::from_secs(1)),
    );
    let job = JobDefinition::new("nightly", "Nightly")
        .with_devices(["slow"])
        .with_options(CaptureOptions {
            commands: vec![
                "show version".to_string(),
                "show interfaces".to_string(),
                SHOW_RUN.to_string(),
            ],
            timeouts: Some(TimeoutConfig {
                session_secs: 2,
                ..Default::default()
            }),
            ..Default::default()
        });

    let run = h
        .dispatcher
        .run_definition(&job, CancellationToken::new())
        .await
        .expect("run");
    let task = &run.tasks[0];
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.error.as_ref().map(|e| e.kind), Some(ErrorKind::SessionTimeout));
    assert!(h.store.history(&DeviceId::from("slow")).await.expect("history").is_empty());
}

#[tokio::test(start_paused = true)]
async fn storage_timeout_is_retried_and_persists_nothing() {
    let h = harness();
    h.inventory.add_device(generic("r1"));
    h.replay
        .script("r1", DeviceScript::new().respond(SHOW_RUN, "hostname r1"));
    h.store.delay_appends(Duration::from_secs(10));
    let mut job = job(&["r1"]);
    job.options.timeouts = Some(TimeoutConfig {
        storage_secs: 1,
        ..Default::default()
    });

    let run = h
        .dispatcher
        .run_definition(&job, CancellationToken::new())
        .await
        .expect("run");
    let task = &run.tasks[0];
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.error.as_ref().map(|e| e.kind), Some(ErrorKind::StorageError));
    assert!(h.store.history(&DeviceId::from("r1")).await.expect("history").is_empty());
}

#[tokio::test]
async fn protocol_error_is_retried_exactly_once() {
    let h = harness();
    h.inventory.add_device(generic("r1"));
    h.replay.script(
        "r1",
        DeviceScript::new().fail(
            SHOW_RUN,
            BackupError::ProtocolError("channel closed".to_string()),
        ),
    );

    let run = h
        .dispatcher
        .run_definition(&job(&["r1"]), CancellationToken::new())
        .await
        .expect("run");
    let task = &run.tasks[0];
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.error.as_ref().map(|e| e.kind), Some(ErrorKind::ProtocolError));
    assert_eq!(h.replay.connect_attempts(&DeviceId::from("r1")), 2);
}

#[tokio::test(start_paused = true)]
async fn runs_finish_while_event_receiver_is_not_drained() {
    let h = harness_with(|config| config.event_channel_capacity = 1);
    h.inventory.add_device(generic("r1"));
    h.replay
        .script("r1", DeviceScript::new().respond(SHOW_RUN, "hostname r1"));
    let _held = h.events;

    for _ in 0..2 {
        let run = tokio::time::timeout(
            Duration::from_secs(60),
            h.dispatcher
                .run_definition(&job(&["r1"]), CancellationToken::new()),
        )
        .await
        .expect("run returned")
        .expect("run");
        assert_eq!(run.status, JobRunStatus::Completed);
    }
}

#[tokio::test]
async fn additional_output_is_tracked_beside_the_configuration() {
    let h = harness_with(|config| {
        config.vendors.insert(
            "generic".to_string(),
            VendorOverride {
                additional_commands: vec!["show ip route".to_string()],
                ..Default::default()
            },
        );
    });
    h.inventory.add_device(generic("r1"));
    h.replay.script(
        "r1",
        DeviceScript::new()
            .respond(SHOW_RUN, "hostname r1")
            .respond("show ip route", "C 10.0.0.0/24")
            .respond("show ip route", "C 10.0.0.0/24")
            .respond("show ip route", "C 10.0.1.0/24"),
    );
    let job = job(&["r1"]);

    let mut runs = Vec::new();
    for _ in 0..3 {
        runs.push(
            h.dispatcher
                .run_definition(&job, CancellationToken::new())
                .await
                .expect("run"),
        );
    }

    let tasks: Vec<_> = runs.iter().map(|r| &r.tasks[0]).collect();
    assert!(tasks.iter().all(|t| t.state == TaskState::Succeeded));
    assert!(tasks.iter().all(|t| t.additional_snapshot.is_some()));
    assert!(!tasks[1].changed && !tasks[1].additional_changed);
    assert!(!tasks[2].changed, "configuration itself did not change");
    assert!(tasks[2].additional_changed);

    let device = DeviceId::from("r1");
    assert_eq!(h.store.history(&device).await.expect("history").len(), 3);
    let extra = h
        .store
        .history(&additional_stream(&device))
        .await
        .expect("additional history");
    assert_eq!(extra.len(), 3);
    assert_eq!(extra[1].duplicate_of, Some(extra[0].id));
    let text = h
        .store
        .content(&extra[2].hash)
        .await
        .expect("content")
        .expect("stored");
    assert_eq!(text, "===== show ip route =====\nC 10.0.1.0/24");
}
