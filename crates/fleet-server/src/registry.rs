//! Device Registry (C2): the in-memory authoritative map of known devices
//! and their liveness. A single coarse lock guards the map; every operation
//! is a sub-microsecond map update and never performs I/O under the lock.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use crate::store::Store;
use crate::types::{ConnectionEventKind, Device, DeviceId};

/// Outcome of a `register` call, used to decide which connection event to
/// record and log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    New,
    Reregistered,
}

pub struct Registry {
    devices: Mutex<HashMap<DeviceId, Device>>,
    store: Store,
}

impl Registry {
    pub fn new(store: Store) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Create or reactivate an entry. Stamps `connected_at` only if the
    /// device is new; an existing online device is a reregistration.
    pub fn register(&self, device_id: &DeviceId, device_type: &str, metadata: serde_json::Value) -> RegisterOutcome {
        let now = Utc::now();
        let mut devices = self.devices.lock().unwrap();

        let outcome = match devices.get(device_id) {
            Some(existing) if existing.is_online => RegisterOutcome::Reregistered,
            _ => RegisterOutcome::New,
        };

        let connected_at = match devices.get(device_id) {
            Some(existing) if outcome == RegisterOutcome::Reregistered => existing.connected_at,
            _ => now,
        };

        devices.insert(
            device_id.clone(),
            Device {
                device_id: device_id.clone(),
                device_type: device_type.to_string(),
                is_online: true,
                last_heartbeat: now,
                connected_at,
                disconnected_at: None,
                metadata,
            },
        );

        info!(device_id = %device_id, device_type, ?outcome, "device registered");
        outcome
    }

    /// Update `last_heartbeat` to now. Called on every inbound frame.
    pub fn touch(&self, device_id: &DeviceId) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(device_id) {
            device.last_heartbeat = Utc::now();
        }
    }

    /// Mark a device offline, stamping `disconnected_at`.
    pub fn mark_offline(&self, device_id: &DeviceId) -> Option<Device> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.get_mut(device_id) {
            if device.is_online {
                device.is_online = false;
                device.disconnected_at = Some(Utc::now());
                return Some(device.clone());
            }
        }
        None
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<Device> {
        self.devices.lock().unwrap().get(device_id).cloned()
    }

    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.lock().unwrap().values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.0.cmp(&b.device_id.0));
        devices
    }

    pub fn list_by_type(&self, device_type: &str) -> Vec<Device> {
        self.devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.device_type == device_type)
            .cloned()
            .collect()
    }

    /// Devices currently marked online but stale past `timeout`.
    pub fn stale_devices(&self, timeout: chrono::Duration) -> Vec<DeviceId> {
        let now = Utc::now();
        self.devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.is_online && now - d.last_heartbeat > timeout)
            .map(|d| d.device_id.clone())
            .collect()
    }

    /// Persist the current in-memory row to the audit store and append a
    /// connection event. Best-effort: failures are logged, never propagated
    /// to the in-memory caller.
    pub async fn sync_and_log(&self, device: &Device, kind: ConnectionEventKind) {
        if let Err(err) = self
            .store
            .upsert_device(
                device.device_id.clone(),
                device.device_type.clone(),
                device.is_online,
                device.last_heartbeat,
                device.connected_at,
                device.disconnected_at,
                device.metadata.clone(),
            )
            .await
        {
            tracing::error!(device_id = %device.device_id, error = format!("{err:#}"), "failed to persist device row");
        }

        if let Err(err) = self
            .store
            .insert_connection_event(
                device.device_id.clone(),
                device.device_type.clone(),
                kind,
                Utc::now(),
                None,
            )
            .await
        {
            tracing::error!(device_id = %device.device_id, error = format!("{err:#}"), "failed to persist connection event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_registry() -> Registry {
        Registry::new(Store::in_memory().unwrap())
    }

    #[test]
    fn register_new_device() {
        let registry = test_registry();
        let id = DeviceId::from("wheelcontroller");
        let outcome = registry.register(&id, "wheel", json!({}));
        assert_eq!(outcome, RegisterOutcome::New);
        assert!(registry.get(&id).unwrap().is_online);
    }

    #[test]
    fn reregister_online_device() {
        let registry = test_registry();
        let id = DeviceId::from("wheelcontroller");
        registry.register(&id, "wheel", json!({}));
        let outcome = registry.register(&id, "wheel", json!({}));
        assert_eq!(outcome, RegisterOutcome::Reregistered);
    }

    #[test]
    fn mark_offline_then_online_again_resets_connected_at_is_not_required() {
        let registry = test_registry();
        let id = DeviceId::from("d1");
        registry.register(&id, "servo", json!({}));
        let offlined = registry.mark_offline(&id).unwrap();
        assert!(!offlined.is_online);
        assert!(offlined.disconnected_at.is_some());
    }

    #[test]
    fn list_by_type_filters() {
        let registry = test_registry();
        registry.register(&DeviceId::from("w1"), "wheel", json!({}));
        registry.register(&DeviceId::from("s1"), "servo", json!({}));
        assert_eq!(registry.list_by_type("wheel").len(), 1);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn stale_devices_detected_past_timeout() {
        let registry = test_registry();
        let id = DeviceId::from("d1");
        registry.register(&id, "wheel", json!({}));
        // Immediately stale with a zero timeout.
        let stale = registry.stale_devices(chrono::Duration::zero());
        assert_eq!(stale, vec![id]);
    }
}
