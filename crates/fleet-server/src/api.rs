//! HTTP surface (C8 read-side projections + C9 write/action routes): the
//! operator command/audio endpoints, the read-only projections over the
//! audit store, the health endpoint, and the `/ws/{device_id}` upgrade.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::error::ApiError;
use crate::logbuf::LogBuffer;
use crate::pipeline::{AudioPipeline, UploadParams};
use crate::registry::Registry;
use crate::router::CommandRouter;
use crate::sessions::SessionManager;
use crate::store::Store;
use crate::types::{CommandStatus, DeviceId};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub sessions: Arc<SessionManager>,
    pub router: Arc<CommandRouter>,
    pub store: Store,
    pub pipeline: Arc<AudioPipeline>,
    pub logs: Arc<LogBuffer>,
    pub read_limit_default: usize,
    pub read_limit_max: usize,
    pub started_at: Instant,
}

impl AppState {
    fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.read_limit_default).min(self.read_limit_max).max(1)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{device_id}", get(ws_upgrade))
        .route("/command", post(post_command))
        .route("/audio/upload", post(post_audio_upload))
        .route("/audio/notify", get(get_audio_notify))
        .route("/devices", get(get_devices))
        .route("/state-history/{device_id}", get(get_state_history))
        .route("/command-logs", get(get_command_logs))
        .route("/device-connection-history/{device_id}", get(get_connection_history))
        .route("/audio/transcripts", get(get_transcripts))
        .route("/logs", get(get_logs))
        .route("/health", get(get_health))
        .with_state(state)
}

async fn ws_upgrade(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let device_id = DeviceId::from(device_id);
    ws.on_upgrade(move |socket| async move {
        state.sessions.accept(device_id, socket).await;
    })
}

#[derive(Debug, Deserialize)]
struct CommandQuery {
    device_type: String,
    command_name: String,
}

async fn post_command(
    State(state): State<AppState>,
    Query(query): Query<CommandQuery>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.device_type.trim().is_empty() || query.command_name.trim().is_empty() {
        return Err(ApiError::BadRequest("device_type and command_name are required".to_string()));
    }

    let record = state
        .router
        .dispatch(&query.device_type, &query.command_name, payload, None)
        .await?;

    Ok(Json(json!({
        "command_id": record.command_id.0,
        "status": record.status.as_str(),
        "target_device_count": record.target_device_count,
    })))
}

#[derive(Debug, Deserialize)]
struct AudioUploadQuery {
    device_id: String,
    #[serde(default)]
    manual: bool,
}

async fn post_audio_upload(
    State(state): State<AppState>,
    Query(query): Query<AudioUploadQuery>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.device_id.trim().is_empty() {
        return Err(ApiError::BadRequest("device_id is required".to_string()));
    }

    let result = state
        .pipeline
        .process_upload(
            UploadParams {
                device_id: DeviceId::from(query.device_id),
                manual: query.manual,
            },
            body.to_vec(),
        )
        .await;

    Ok(Json(serde_json::to_value(result).map_err(|e| ApiError::Internal(e.into()))?))
}

#[derive(Debug, Deserialize)]
struct NotifyQuery {
    device_id: String,
    text: String,
}

async fn get_audio_notify(State(state): State<AppState>, Query(query): Query<NotifyQuery>) -> Json<serde_json::Value> {
    let device_id = DeviceId::from(query.device_id);
    let ok = match state.pipeline.notify(&device_id, &query.text).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(%device_id, error = %err, "audio notify failed");
            false
        }
    };
    tracing::info!(%device_id, text = %query.text, ok, "audio notify requested");
    Json(json!({ "ok": ok }))
}

async fn get_devices(State(state): State<AppState>) -> Json<serde_json::Value> {
    let devices = state.registry.list();
    Json(json!({ "total": devices.len(), "devices": devices }))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn get_state_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = state.clamp_limit(query.limit);
    let snapshots = state
        .store
        .latest_state_snapshots(DeviceId::from(device_id), limit)
        .await?;
    Ok(Json(json!({ "snapshots": snapshots })))
}

#[derive(Debug, Deserialize)]
struct CommandLogsQuery {
    limit: Option<usize>,
    status: Option<String>,
    device_type: Option<String>,
}

async fn get_command_logs(
    State(state): State<AppState>,
    Query(query): Query<CommandLogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = state.clamp_limit(query.limit);
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<CommandStatus>())
        .transpose()
        .map_err(|_| ApiError::BadRequest("unrecognised status filter".to_string()))?;

    let commands = state.store.list_commands(limit, status, query.device_type).await?;
    Ok(Json(json!({ "commands": commands })))
}

async fn get_connection_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = state.clamp_limit(query.limit);
    let events = state
        .store
        .connection_history(DeviceId::from(device_id), limit)
        .await?;
    Ok(Json(json!({ "events": events })))
}

async fn get_transcripts(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = state.clamp_limit(query.limit);
    let transcripts = state.store.latest_transcripts(limit).await?;
    Ok(Json(json!({ "transcripts": transcripts })))
}

async fn get_logs(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(state.read_limit_default).min(state.read_limit_max).max(1);
    Json(json!({ "lines": state.logs.recent(limit) }))
}

async fn get_health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let devices = state.registry.list();
    let devices_online = devices.iter().filter(|d| d.is_online).count();
    let commands_pending = state
        .store
        .list_commands(state.read_limit_max, Some(CommandStatus::Sent), None)
        .await?
        .len();

    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "devices_online": devices_online,
        "commands_pending": commands_pending,
    })))
}
