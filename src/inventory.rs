//! Device, group and job read model.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{BackupError, Result};
use crate::model::{Device, DeviceGroup, DeviceGroupId, DeviceId, JobDefinition, JobId};

/// Finalized views supplied by the administrative surface.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn device(&self, id: &DeviceId) -> Result<Option<Arc<Device>>>;
    async fn group(&self, id: &DeviceGroupId) -> Result<Option<DeviceGroup>>;
    async fn job(&self, id: &JobId) -> Result<Option<JobDefinition>>;
    async fn jobs(&self) -> Result<Vec<JobDefinition>>;
}

#[derive(Debug, Default)]
struct Tables {
    devices: HashMap<DeviceId, Arc<Device>>,
    groups: HashMap<DeviceGroupId, DeviceGroup>,
    jobs: HashMap<JobId, JobDefinition>,
}

/// In-memory inventory.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    tables: RwLock<Tables>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device: Device) {
        if let Ok(mut tables) = self.tables.write() {
            tables.devices.insert(device.id.clone(), Arc::new(device));
        }
    }

    pub fn add_group<I, S>(&self, id: impl Into<String>, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let group = DeviceGroup {
            id: DeviceGroupId(id.clone()),
            name: id,
            devices: members.into_iter().map(|m| DeviceId(m.into())).collect(),
        };
        if let Ok(mut tables) = self.tables.write() {
            tables.groups.insert(group.id.clone(), group);
        }
    }

    pub fn add_job(&self, job: JobDefinition) {
        if let Ok(mut tables) = self.tables.write() {
            tables.jobs.insert(job.id.clone(), job);
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|e| BackupError::InvalidConfig(format!("inventory lock poisoned: {e}")))
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn device(&self, id: &DeviceId) -> Result<Option<Arc<Device>>> {
        Ok(self.read()?.devices.get(id).cloned())
    }

    async fn group(&self, id: &DeviceGroupId) -> Result<Option<DeviceGroup>> {
        Ok(self.read()?.groups.get(id).cloned())
    }

    async fn job(&self, id: &JobId) -> Result<Option<JobDefinition>> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    async fn jobs(&self) -> Result<Vec<JobDefinition>> {
        let mut jobs: Vec<_> = self.read()?.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }
}
