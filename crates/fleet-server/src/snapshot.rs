//! State Snapshot Ingestor (C6): on each `status` frame delivered by the
//! session manager, persist a snapshot and refresh liveness. Failures are
//! logged; the frame is never retried.

use chrono::Utc;

use crate::store::Store;
use crate::types::DeviceId;

pub async fn ingest(store: &Store, device_id: &DeviceId, device_type: &str, payload: serde_json::Value) {
    let result = store
        .insert_state_snapshot(device_id.clone(), device_type.to_string(), payload, Utc::now())
        .await;

    if let Err(err) = result {
        tracing::error!(%device_id, error = format!("{err:#}"), "failed to persist state snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ingest_persists_snapshot() {
        let store = Store::in_memory().unwrap();
        let id = DeviceId::from("wheelcontroller");
        ingest(&store, &id, "wheel", json!({"battery": 80})).await;

        let snapshots = store.latest_state_snapshots(id, 10).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].payload, json!({"battery": 80}));
    }
}
