//! Per-device fix history and geofence state
//!
//! Every device owns one `DeviceState` behind its own mutex. Holding that
//! lock is what serializes ingestion per device; different devices never
//! contend. The registry map itself is only write-locked to add a device.

use crate::domain::types::{DeviceId, Fix};
use crate::services::geofence::DeviceZoneState;
use crate::services::jump_detector::LastFixLookup;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Everything known about one device
#[derive(Debug, Default)]
pub struct DeviceState {
    /// Accepted fixes in non-decreasing timestamp order
    fixes: Vec<Fix>,
    /// Open zone entries
    pub zones: DeviceZoneState,
}

impl DeviceState {
    pub fn latest(&self) -> Option<&Fix> {
        self.fixes.last()
    }

    /// Append keeping timestamp order; equal timestamps go after existing ones
    pub fn push(&mut self, fix: Fix) {
        let at = self.fixes.partition_point(|f| f.timestamp <= fix.timestamp);
        self.fixes.insert(at, fix);
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn all(&self) -> &[Fix] {
        &self.fixes
    }

    /// Fixes with `start <= timestamp <= end`
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[Fix] {
        if start > end {
            return &[];
        }
        let lo = self.fixes.partition_point(|f| f.timestamp < start);
        let hi = self.fixes.partition_point(|f| f.timestamp <= end);
        &self.fixes[lo..hi]
    }

    /// The newest `n` fixes, oldest first
    pub fn recent(&self, n: usize) -> &[Fix] {
        &self.fixes[self.fixes.len().saturating_sub(n)..]
    }

    /// Drop fixes older than `cutoff`, returning how many were removed
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let n = self.fixes.partition_point(|f| f.timestamp < cutoff);
        self.fixes.drain(..n);
        n
    }
}

/// Registry of device states
#[derive(Default)]
pub struct History {
    devices: RwLock<FxHashMap<DeviceId, Arc<Mutex<DeviceState>>>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// State handle for a device, created empty on first use
    pub fn device(&self, device_id: DeviceId) -> Arc<Mutex<DeviceState>> {
        if let Some(state) = self.devices.read().get(&device_id) {
            return state.clone();
        }
        let mut devices = self.devices.write();
        devices
            .entry(device_id)
            .or_insert_with(|| {
                debug!(device_id = %device_id, "device_registered");
                Arc::new(Mutex::new(DeviceState::default()))
            })
            .clone()
    }

    /// State handle for a device that has been seen or registered
    pub fn get(&self, device_id: DeviceId) -> Option<Arc<Mutex<DeviceState>>> {
        self.devices.read().get(&device_id).cloned()
    }

    /// Make a device known without any fix
    pub fn register(&self, device_id: DeviceId) {
        self.device(device_id);
    }

    /// Known device ids, ascending
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.devices.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Copy of a device's fixes in `[start, end]`
    pub fn range(&self, device_id: DeviceId, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Fix> {
        self.get(device_id).map(|s| s.lock().range(start, end).to_vec()).unwrap_or_default()
    }

    /// Copy of a device's newest `n` fixes, oldest first
    pub fn recent(&self, device_id: DeviceId, n: usize) -> Vec<Fix> {
        self.get(device_id).map(|s| s.lock().recent(n).to_vec()).unwrap_or_default()
    }

    /// Drop every fix older than `cutoff`; devices and their open entries stay
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let states: Vec<_> = self.devices.read().values().cloned().collect();
        states.iter().map(|s| s.lock().prune_before(cutoff)).sum()
    }
}

impl LastFixLookup for History {
    fn last_fix(&self, device_id: DeviceId) -> Option<Fix> {
        self.get(device_id).and_then(|s| s.lock().latest().cloned())
    }
}
