//! Registry of every fast-path device of a process.

use crate::device::Device;
use crate::stats::FastpathStats;
use fpx_error::{FpxError, Result};
use fpx_types::DeviceId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// All devices sharing one slow-path connection.
#[derive(Debug, Default)]
pub struct FastpathContext {
    devices: RwLock<BTreeMap<DeviceId, Arc<Device>>>,
}

impl FastpathContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device`. Ids must be unique.
    pub fn add(&self, device: Device) -> Result<Arc<Device>> {
        let mut devices = self.devices.write();
        let id = device.id();
        if devices.contains_key(&id) {
            return Err(FpxError::InvalidConfig(format!("device {id} already registered")));
        }
        let device = Arc::new(device);
        devices.insert(id, Arc::clone(&device));
        Ok(device)
    }

    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.read().get(&id).cloned()
    }

    /// Unregister a device and shut it down.
    pub fn remove(&self, id: DeviceId) -> Option<Arc<Device>> {
        let device = self.devices.write().remove(&id)?;
        device.shutdown();
        Some(device)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Propagate the slow-path connection state to every device.
    ///
    /// Disconnecting disables each fast path; requests then fail with
    /// `NoDevice`. Reconnecting reopens every device's configured backing
    /// stores. Failures are logged per device; the first is returned.
    pub fn set_connected(&self, connected: bool) -> Result<()> {
        let devices: Vec<Arc<Device>> = self.devices.read().values().cloned().collect();
        info!(target: "fpx::reconfig", connected, devices = devices.len(), "context_connection");
        let mut first = None;
        for device in devices {
            if let Err(err) = device.set_connected(connected) {
                warn!(
                    target: "fpx::reconfig",
                    device = %device.id(),
                    connected,
                    error = %err,
                    "device_connection_failed"
                );
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Stats of every device, ordered by id.
    #[must_use]
    pub fn stats(&self) -> Vec<FastpathStats> {
        self.devices.read().values().map(|d| d.stats()).collect()
    }
}
