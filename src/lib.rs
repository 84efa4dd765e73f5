//! # netsnap - Network Device Configuration Backup Engine
//!
//! `netsnap` collects configuration state from routers, switches, firewalls
//! and generic SSH hosts on a schedule, without ever issuing a
//! configuration-changing command. Each successful capture becomes an
//! immutable snapshot; unchanged captures are recorded as duplicates and
//! changed ones are diffed against the last known-good configuration.
//!
//! ## Features
//!
//! - **Vendor Drivers**: Built-in command tables for Cisco IOS/NX-OS/ASA, Junos, EOS, FortiOS, PAN-OS and Linux
//! - **Read-Only Guard**: Operator and override commands starting with a mutating verb are rejected
//! - **SSH and Telnet**: Interactive shells with prompt detection, pagination and enable escalation
//! - **Bounded Concurrency**: Worker pool per run plus a system-wide per-device lease
//! - **Retries**: Transient failures retried with fixed or exponential backoff
//! - **Change Detection**: SHA-256 deduplication and line diffs against the baseline snapshot
//! - **Offline Testing**: Replay connector driven by JSONL transcripts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use netsnap::config::EngineConfig;
//! use netsnap::credential::{CredentialView, StaticCredentialStore};
//! use netsnap::dispatcher::Dispatcher;
//! use netsnap::inventory::MemoryInventory;
//! use netsnap::model::{Device, JobDefinition, JobId};
//! use netsnap::snapshot::FileSnapshotStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let inventory = Arc::new(MemoryInventory::new());
//!     inventory.add_device(Device::new("core-1", "192.168.1.1", "cisco_ios", "ro"));
//!     inventory.add_job(JobDefinition::new("nightly", "Nightly").with_devices(["core-1"]));
//!
//!     let credentials = Arc::new(
//!         StaticCredentialStore::new().with("ro", CredentialView::new("backup", "password")),
//!     );
//!     let store = Arc::new(FileSnapshotStore::open("/var/lib/netsnap").await?);
//!
//!     let (dispatcher, mut events) =
//!         Dispatcher::from_config(EngineConfig::default(), inventory, credentials, store)?;
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{}", serde_json::to_string(&event).unwrap_or_default());
//!         }
//!     });
//!
//!     let run = dispatcher
//!         .run_job(&JobId::from("nightly"), CancellationToken::new())
//!         .await?;
//!     println!("run {} finished {:?}", run.id, run.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`dispatcher::Dispatcher`] - Expands jobs into tasks and runs them on a worker pool
//! - [`scheduler::Scheduler`] - Fires enabled jobs whose cron schedule is due
//! - [`driver::DriverRegistry`] - Vendor command tables, sanitization and the read-only guard
//! - [`session::ConnectionManager`] - Opens SSH/Telnet sessions with timeouts and fallback
//! - [`capture::CaptureEngine`] - Runs setup, capture and info commands on a session
//! - [`snapshot::ChangeDetector`] - Deduplicates captures and computes diffs
//! - [`run::RunTracker`] - Queryable state of runs and tasks
//! - [`error::BackupError`] - Error taxonomy driving the retry policy

pub mod capture;
pub mod config;
pub mod credential;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod inventory;
pub mod lease;
pub mod model;
pub mod prompt;
pub mod run;
pub mod schedule;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod task;
pub mod vendor;
