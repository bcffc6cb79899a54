//! Command Router (C5): issues commands addressed to device classes,
//! correlates acknowledgements back to the issuer, and maintains lifecycle
//! state in the audit store. A single mutex guards the pending-ack map;
//! updates are bounded-time map operations, never held across a suspension
//! point.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::sessions::{AckStatus, OutboundFrame, SessionManager};
use crate::store::Store;
use crate::types::{CommandId, CommandRecord, CommandStatus};

struct PendingAck {
    expected: u32,
    received: u32,
    success: u32,
    last_response: Option<serde_json::Value>,
    deadline: Instant,
}

pub struct CommandRouter {
    sessions: Arc<SessionManager>,
    store: Store,
    pending: Mutex<HashMap<CommandId, PendingAck>>,
    default_ack_timeout: Duration,
}

impl CommandRouter {
    pub fn new(sessions: Arc<SessionManager>, store: Store, default_ack_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            store,
            pending: Mutex::new(HashMap::new()),
            default_ack_timeout,
        })
    }

    /// Allocate a command, fan it out to every online session of
    /// `device_type`, and register a pending-ack entry for the fan-out's
    /// actual successes. Returns the created record's terminal-or-sent
    /// state.
    pub async fn dispatch(
        &self,
        device_type: &str,
        command_name: &str,
        payload: serde_json::Value,
        ack_timeout: Option<Duration>,
    ) -> anyhow::Result<CommandRecord> {
        let command_id = CommandId::new();
        let created_at = Utc::now();

        self.store
            .create_command(
                command_id.clone(),
                device_type.to_string(),
                command_name.to_string(),
                payload.clone(),
                created_at,
            )
            .await?;

        let outcomes = self.sessions.send_to_type(
            device_type,
            OutboundFrame::Command {
                command_id: command_id.0.clone(),
                command_name: command_name.to_string(),
                payload,
            },
        );
        let target_device_count = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == crate::types::SendOutcome::Ok)
            .count() as u32;

        if target_device_count == 0 {
            let completed_at = Utc::now();
            self.store
                .update_command_status(
                    command_id.clone(),
                    CommandStatus::NoTargets,
                    Some(0),
                    None,
                    Some(completed_at),
                    None,
                    None,
                )
                .await?;
            info!(%command_id, device_type, command_name, "command has no online targets");
        } else {
            let executed_at = Utc::now();
            self.store
                .update_command_status(
                    command_id.clone(),
                    CommandStatus::Sent,
                    Some(target_device_count),
                    Some(executed_at),
                    None,
                    None,
                    None,
                )
                .await?;

            let deadline = Instant::now() + ack_timeout.unwrap_or(self.default_ack_timeout);
            self.pending.lock().unwrap().insert(
                command_id.clone(),
                PendingAck {
                    expected: target_device_count,
                    received: 0,
                    success: 0,
                    last_response: None,
                    deadline,
                },
            );
            info!(%command_id, device_type, command_name, target_device_count, "command dispatched");
        }

        self.store
            .get_command(command_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("command vanished immediately after creation"))
    }

    /// Correlate a `command_ack` frame. Acks for unknown or already-completed
    /// commands are logged and dropped.
    pub async fn handle_ack(&self, command_id: CommandId, status: AckStatus, response: Option<serde_json::Value>) {
        let completed = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get_mut(&command_id) {
                None => {
                    warn!(%command_id, "ack for unknown or completed command, dropping");
                    return;
                }
                Some(entry) => {
                    entry.received += 1;
                    if status == AckStatus::Success {
                        entry.success += 1;
                    }
                    if response.is_some() {
                        entry.last_response = response;
                    }
                    if entry.received >= entry.expected {
                        let finished = pending.remove(&command_id).unwrap();
                        Some(finished)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(finished) = completed {
            let final_status = if finished.success == finished.received {
                CommandStatus::AckSuccess
            } else {
                CommandStatus::AckError
            };
            let completed_at = Utc::now();
            if let Err(err) = self
                .store
                .update_command_status(
                    command_id.clone(),
                    final_status,
                    None,
                    None,
                    Some(completed_at),
                    finished.last_response,
                    Some(finished.success),
                )
                .await
            {
                tracing::error!(%command_id, error = format!("{err:#}"), "failed to persist ack completion");
            }
            info!(%command_id, ?final_status, "command acknowledged");
        }
    }

    /// Piggy-backed on the heartbeat reaper tick: transition any pending
    /// command past its deadline to `timeout`. Late acks that arrive after
    /// this are logged and dropped by `handle_ack`.
    pub async fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<(CommandId, u32)> = {
            let mut pending = self.pending.lock().unwrap();
            let expired_ids: Vec<CommandId> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids
                .into_iter()
                .map(|id| {
                    let entry = pending.remove(&id).unwrap();
                    (id, entry.success)
                })
                .collect()
        };

        for (command_id, success_count) in expired {
            warn!(%command_id, "command ack deadline elapsed, transitioning to timeout");
            let completed_at = Utc::now();
            if let Err(err) = self
                .store
                .update_command_status(
                    command_id.clone(),
                    CommandStatus::Timeout,
                    None,
                    None,
                    Some(completed_at),
                    None,
                    Some(success_count),
                )
                .await
            {
                tracing::error!(%command_id, error = format!("{err:#}"), "failed to persist timeout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use serde_json::json;

    fn test_router() -> (Arc<CommandRouter>, Arc<SessionManager>, Store) {
        let store = Store::in_memory().unwrap();
        let registry = Arc::new(Registry::new(store.clone()));
        let sessions = SessionManager::new(registry, store.clone(), 8, vec![]);
        let router = CommandRouter::new(sessions.clone(), store.clone(), Duration::from_secs(30));
        sessions.set_router(router.clone());
        (router, sessions, store)
    }

    #[tokio::test]
    async fn dispatch_with_no_targets_terminates_immediately() {
        let (router, _sessions, _store) = test_router();
        let record = router
            .dispatch("servo", "handsup", json!({}), None)
            .await
            .unwrap();
        assert_eq!(record.status, CommandStatus::NoTargets);
        assert_eq!(record.target_device_count, 0);
    }

    #[tokio::test]
    async fn ack_for_unknown_command_is_dropped_silently() {
        let (router, _sessions, _store) = test_router();
        router
            .handle_ack(CommandId("ghost".into()), AckStatus::Success, None)
            .await;
        // No panic, no state to assert beyond "didn't crash".
    }
}
