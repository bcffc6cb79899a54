//! Heartbeat Reaper (C4): a single long-lived, cancellable task that scans
//! the registry for devices stale past the configured timeout and closes
//! their sessions. The command router's ack-deadline sweep is piggy-backed
//! on the same tick rather than running its own timer.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::registry::Registry;
use crate::router::CommandRouter;
use crate::sessions::SessionManager;
use crate::types::ConnectionEventKind;

pub fn spawn(
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
    router: Arc<CommandRouter>,
    tick_interval: Duration,
    heartbeat_timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let timeout = ChronoDuration::from_std(heartbeat_timeout).unwrap_or(ChronoDuration::seconds(90));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("heartbeat reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    for device_id in registry.stale_devices(timeout) {
                        if let Some(device) = registry.mark_offline(&device_id) {
                            info!(%device_id, "device timed out, marking offline");
                            sessions.close(&device_id);
                            registry.sync_and_log(&device, ConnectionEventKind::Timeout).await;
                        }
                    }
                    router.sweep_timeouts().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::DeviceId;
    use serde_json::json;

    #[tokio::test]
    async fn reaper_marks_stale_devices_offline() {
        let store = Store::in_memory().unwrap();
        let registry = Arc::new(Registry::new(store.clone()));
        let sessions = SessionManager::new(registry.clone(), store.clone(), 8, vec![]);
        let router = CommandRouter::new(sessions.clone(), store.clone(), Duration::from_secs(30));
        sessions.set_router(router.clone());

        let id = DeviceId::from("wheelcontroller");
        registry.register(&id, "wheel", json!({}));

        let cancel = CancellationToken::new();
        let handle = spawn(
            registry.clone(),
            sessions.clone(),
            router.clone(),
            Duration::from_millis(10),
            Duration::from_millis(0),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.get(&id).unwrap().is_online);

        cancel.cancel();
        handle.await.unwrap();
    }
}
