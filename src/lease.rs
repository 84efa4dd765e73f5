//! Per-device mutual exclusion.
//!
//! A [`LeaseMap`] is shared by every run of a dispatcher. A device appears
//! in the map while a task of any run is working on it; the returned
//! [`DeviceLease`] removes it again on drop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::model::DeviceId;

#[derive(Debug, Clone, Default)]
pub struct LeaseMap {
    held: Arc<Mutex<HashSet<DeviceId>>>,
}

impl LeaseMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease on `device`, or `None` if another task holds it.
    pub fn try_acquire(&self, device: &DeviceId) -> Option<DeviceLease> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(device.clone()) {
            return None;
        }
        Some(DeviceLease {
            device: device.clone(),
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, device: &DeviceId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(device)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Exclusive right to work on one device.
#[derive(Debug)]
pub struct DeviceLease {
    device: DeviceId,
    held: Arc<Mutex<HashSet<DeviceId>>>,
}

impl DeviceLease {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.device);
    }
}
