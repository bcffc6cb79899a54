//! Core data model: devices, sessions, commands, events, transcripts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque device identifier, unique across the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Correlation id for a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new() -> Self {
        CommandId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-memory authoritative record of a device's identity and liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub device_type: String,
    pub is_online: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Command lifecycle status. Transitions are monotonic: `created` is
/// followed by either `sent` (then a terminal ack/timeout state) or
/// `no_targets` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Created,
    Sent,
    AckSuccess,
    AckError,
    Timeout,
    NoTargets,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Created => "created",
            CommandStatus::Sent => "sent",
            CommandStatus::AckSuccess => "ack_success",
            CommandStatus::AckError => "ack_error",
            CommandStatus::Timeout => "timeout",
            CommandStatus::NoTargets => "no_targets",
        }
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(CommandStatus::Created),
            "sent" => Ok(CommandStatus::Sent),
            "ack_success" => Ok(CommandStatus::AckSuccess),
            "ack_error" => Ok(CommandStatus::AckError),
            "timeout" => Ok(CommandStatus::Timeout),
            "no_targets" => Ok(CommandStatus::NoTargets),
            other => anyhow::bail!("unknown command status: {other}"),
        }
    }
}

/// A dispatched command and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: CommandId,
    pub device_type: String,
    pub command_name: String,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub target_device_count: u32,
    pub success_count: u32,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response_payload: Option<serde_json::Value>,
}

/// Append-only telemetry frame from a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStateSnapshot {
    pub id: i64,
    pub device_id: DeviceId,
    pub device_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Kind of append-only connection lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Timeout,
    Reregistered,
}

impl ConnectionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEventKind::Connected => "connected",
            ConnectionEventKind::Disconnected => "disconnected",
            ConnectionEventKind::Timeout => "timeout",
            ConnectionEventKind::Reregistered => "reregistered",
        }
    }
}

/// Append-only connection/disconnection/reregistration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub id: i64,
    pub device_id: DeviceId,
    pub device_type: String,
    pub kind: ConnectionEventKind,
    pub timestamp: DateTime<Utc>,
    pub details: Option<serde_json::Value>,
}

/// Append-only record of one audio upload's decision chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTranscript {
    pub id: i64,
    pub device_id: DeviceId,
    pub raw_text: String,
    pub normalized_text: String,
    pub prefix_ok: bool,
    pub matched_command: Option<String>,
    pub confidence: Option<f64>,
    pub manual: bool,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of enqueueing a frame to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    NoSuchDevice,
    QueueFull,
    SendFailed,
}

impl SendOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendOutcome::Ok => "ok",
            SendOutcome::NoSuchDevice => "no_such_device",
            SendOutcome::QueueFull => "queue_full",
            SendOutcome::SendFailed => "send_failed",
        }
    }
}
