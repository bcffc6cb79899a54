//! Session Manager (C3): owns the set of live bidirectional channels keyed
//! by device id. Every session runs two cooperative tasks sharing a handle —
//! an inbound dispatcher that reads frames and routes them by discriminator,
//! and an outbound pump that drains a bounded queue to the socket. The
//! outbound task is the single writer for its session; a lock on the
//! session map is never held across a socket read or write.

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::registry::{RegisterOutcome, Registry};
use crate::router::CommandRouter;
use crate::store::Store;
use crate::types::{ConnectionEventKind, DeviceId, SendOutcome};

/// Frames the server writes to a device.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Command {
        command_id: String,
        command_name: String,
        payload: serde_json::Value,
    },
    AudioChunk {
        audio_base64: String,
        is_last: bool,
        samplerate: u32,
        format: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Error,
}

/// Frames a device writes to the server.
#[derive(Debug, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum InboundFrame {
    Registration {
        device_type: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    Heartbeat {
        #[allow(dead_code)]
        device_type: String,
    },
    Status {
        device_type: String,
        payload: serde_json::Value,
    },
    CommandAck {
        #[allow(dead_code)]
        device_type: String,
        command_id: String,
        status: AckStatus,
        #[serde(default)]
        response: Option<serde_json::Value>,
    },
    AudioChunk {
        #[serde(default)]
        #[allow(dead_code)]
        audio_base64: Option<String>,
    },
    AudioResponseEnd {},
}

struct Session {
    device_type: Mutex<Option<String>>,
    tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

pub struct SessionManager {
    sessions: DashMap<DeviceId, Arc<Session>>,
    registry: Arc<Registry>,
    store: Store,
    router: OnceLock<Arc<CommandRouter>>,
    outbound_capacity: usize,
    reserved_ids: HashSet<String>,
}

impl SessionManager {
    pub fn new(registry: Arc<Registry>, store: Store, outbound_capacity: usize, reserved_ids: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            registry,
            store,
            router: OnceLock::new(),
            outbound_capacity,
            reserved_ids: reserved_ids.into_iter().collect(),
        })
    }

    /// Wire in the command router after construction — breaks the
    /// otherwise-circular dependency between dispatch (router -> sessions)
    /// and ack delivery (sessions -> router). Set exactly once at startup.
    pub fn set_router(&self, router: Arc<CommandRouter>) {
        let _ = self.router.set(router);
    }

    /// Install a session for an accepted websocket upgrade. Reserved
    /// identifiers are refused outright. A pre-existing session for the
    /// same id is evicted first; its replacement is logged as a
    /// reregistration once the new session's own `registration` frame
    /// arrives and re-derives that outcome from the registry.
    #[instrument(skip(self, socket), fields(device_id = %device_id))]
    pub async fn accept(self: &Arc<Self>, device_id: DeviceId, socket: WebSocket) {
        if self.reserved_ids.contains(&device_id.0) {
            warn!("refusing reserved device id at session accept");
            let _ = socket.close().await;
            return;
        }

        self.evict(&device_id);

        let (tx, mut rx) = mpsc::channel(self.outbound_capacity);
        let cancel = CancellationToken::new();
        let session = Arc::new(Session {
            device_type: Mutex::new(None),
            tx,
            cancel: cancel.clone(),
        });
        self.sessions.insert(device_id.clone(), session);
        info!("session accepted");

        let (mut ws_tx, mut ws_rx) = socket.split();

        let out_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = out_cancel.cancelled() => break,
                    frame = rx.recv() => {
                        match frame {
                            Some(frame) => {
                                let text = match serde_json::to_string(&frame) {
                                    Ok(text) => text,
                                    Err(err) => {
                                        warn!(error = %err, "failed to encode outbound frame");
                                        continue;
                                    }
                                };
                                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let manager = self.clone();
        let in_device_id = device_id.clone();
        tokio::spawn(async move {
            let mut ended_naturally = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        ended_naturally = false;
                        break;
                    }
                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                manager.handle_inbound(&in_device_id, text.as_str()).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(_)) => break,
                            _ => {}
                        }
                    }
                }
            }
            if ended_naturally {
                manager.on_session_ended(&in_device_id).await;
            }
        });
    }

    fn evict(&self, device_id: &DeviceId) {
        if let Some((_, session)) = self.sessions.remove(device_id) {
            session.cancel.cancel();
        }
    }

    async fn handle_inbound(self: &Arc<Self>, device_id: &DeviceId, text: &str) {
        self.registry.touch(device_id);

        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%device_id, error = %err, "dropping unrecognised inbound frame");
                return;
            }
        };

        match frame {
            InboundFrame::Registration { device_type, metadata } => {
                if let Some(session) = self.sessions.get(device_id) {
                    *session.device_type.lock().unwrap() = Some(device_type.clone());
                }
                let outcome = self.registry.register(device_id, &device_type, metadata);
                if let Some(device) = self.registry.get(device_id) {
                    let kind = match outcome {
                        RegisterOutcome::New => ConnectionEventKind::Connected,
                        RegisterOutcome::Reregistered => ConnectionEventKind::Reregistered,
                    };
                    self.registry.sync_and_log(&device, kind).await;
                }
            }
            InboundFrame::Heartbeat { .. } => {}
            InboundFrame::AudioChunk { .. } | InboundFrame::AudioResponseEnd {} => {}
            InboundFrame::Status { device_type, payload } => {
                crate::snapshot::ingest(&self.store, device_id, &device_type, payload).await;
            }
            InboundFrame::CommandAck {
                command_id,
                status,
                response,
                ..
            } => {
                if let Some(router) = self.router.get() {
                    router
                        .handle_ack(crate::types::CommandId(command_id), status, response)
                        .await;
                } else {
                    warn!(%device_id, "command router not wired, dropping ack");
                }
            }
        }
    }

    /// Natural disconnect: the underlying socket closed or errored without
    /// an explicit `close()`/reconnect having already evicted it.
    async fn on_session_ended(&self, device_id: &DeviceId) {
        self.sessions.remove(device_id);
        if let Some(device) = self.registry.mark_offline(device_id) {
            info!(%device_id, "session ended, device marked offline");
            self.registry.sync_and_log(&device, ConnectionEventKind::Disconnected).await;
        }
    }

    /// Force-close a session, e.g. from the heartbeat reaper. Does not
    /// itself mutate the registry — callers that need an offline
    /// transition (the reaper) perform it explicitly before calling this.
    pub fn close(&self, device_id: &DeviceId) {
        self.evict(device_id);
    }

    pub fn send(&self, device_id: &DeviceId, frame: OutboundFrame) -> SendOutcome {
        match self.sessions.get(device_id) {
            None => SendOutcome::NoSuchDevice,
            Some(session) => match session.tx.try_send(frame) {
                Ok(()) => SendOutcome::Ok,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%device_id, "outbound queue full, dropping newest frame");
                    SendOutcome::QueueFull
                }
                Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::SendFailed,
            },
        }
    }

    pub fn send_to_type(&self, device_type: &str, frame: OutboundFrame) -> Vec<(DeviceId, SendOutcome)> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().device_type.lock().unwrap().as_deref() == Some(device_type))
            .map(|entry| {
                let device_id = entry.key().clone();
                let outcome = match entry.value().tx.try_send(frame.clone()) {
                    Ok(()) => SendOutcome::Ok,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(%device_id, "outbound queue full, dropping newest frame");
                        SendOutcome::QueueFull
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::SendFailed,
                };
                (device_id, outcome)
            })
            .collect()
    }

    pub fn is_online(&self, device_id: &DeviceId) -> bool {
        self.sessions.contains_key(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> Arc<SessionManager> {
        let store = Store::in_memory().unwrap();
        let registry = Arc::new(Registry::new(store.clone()));
        SessionManager::new(registry, store, 4, vec!["dashboard".to_string()])
    }

    #[test]
    fn send_to_unknown_device_is_no_such_device() {
        let manager = test_manager();
        let outcome = manager.send(
            &DeviceId::from("ghost"),
            OutboundFrame::Command {
                command_id: "c1".into(),
                command_name: "forward".into(),
                payload: serde_json::json!({}),
            },
        );
        assert_eq!(outcome, SendOutcome::NoSuchDevice);
    }

    #[test]
    fn is_online_reflects_session_presence() {
        let manager = test_manager();
        assert!(!manager.is_online(&DeviceId::from("wheelcontroller")));
    }
}
