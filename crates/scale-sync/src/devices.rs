//! Known devices and their connection descriptors.
//!
//! Filled by device registry notifications; the engine reads from it when
//! it needs to open a session.

use std::collections::HashMap;
use std::sync::RwLock;

use scale_core::DeviceId;

use crate::error::{SyncError, SyncResult};
use crate::link::DeviceDescriptor;

/// Descriptors by device id. Cheap to read from any task.
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    devices: RwLock<HashMap<DeviceId, DeviceDescriptor>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a descriptor. Returns the previous one.
    pub fn upsert(&self, descriptor: DeviceDescriptor) -> Option<DeviceDescriptor> {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.insert(descriptor.id, descriptor)
    }

    /// Forgets a device. Engine calls already waiting on its sync lock see
    /// it gone once they get the lock.
    pub fn remove(&self, id: DeviceId) -> Option<DeviceDescriptor> {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.remove(&id)
    }

    /// ## Errors
    /// - `UnknownDevice` if the id was never registered or was removed
    pub fn get(&self, id: DeviceId) -> SyncResult<DeviceDescriptor> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices.get(&id).cloned().ok_or(SyncError::UnknownDevice(id))
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices.contains_key(&id)
    }

    /// All device ids, sorted.
    pub fn ids(&self) -> Vec<DeviceId> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<_> = devices.keys().copied().collect();
        ids.sort();
        ids
    }
}
