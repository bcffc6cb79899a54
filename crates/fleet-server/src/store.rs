//! Audit Store (C1): durable, append-or-upsert persistence with indexed
//! read queries. Follower to the in-memory authoritative state in the
//! registry and session manager — a write failure here is logged and
//! surfaced to the caller, it never rolls back in-memory state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::{
    AudioTranscript, CommandRecord, CommandStatus, ConnectionEvent, ConnectionEventKind, Device,
    DeviceId, DeviceStateSnapshot,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    device_type TEXT NOT NULL,
    is_online INTEGER NOT NULL,
    last_heartbeat TEXT NOT NULL,
    connected_at TEXT NOT NULL,
    disconnected_at TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS state_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    device_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_device ON state_snapshots(device_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS commands (
    command_id TEXT PRIMARY KEY,
    device_type TEXT NOT NULL,
    command_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    target_device_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    executed_at TEXT,
    completed_at TEXT,
    response_payload TEXT
);
CREATE INDEX IF NOT EXISTS idx_commands_created ON commands(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_commands_status ON commands(status);
CREATE INDEX IF NOT EXISTS idx_commands_type ON commands(device_type);

CREATE TABLE IF NOT EXISTS connection_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    device_type TEXT NOT NULL,
    kind TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_device ON connection_events(device_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS audio_transcripts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    raw_text TEXT NOT NULL,
    normalized_text TEXT NOT NULL,
    prefix_ok INTEGER NOT NULL,
    matched_command TEXT,
    confidence REAL,
    manual INTEGER NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transcripts_time ON audio_transcripts(timestamp DESC);
"#;

/// SQLite-backed audit store. Each call opens a fresh connection (WAL mode,
/// busy timeout) so concurrent readers and writers never block on a shared
/// handle; the `Database` itself only carries the path.
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {parent:?}"))?;
        }
        let db = Self { path };
        let conn = db.conn()?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize audit store schema")?;
        Ok(db)
    }

    /// Unique temp-file database, suitable for tests.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let temp_dir = std::env::temp_dir();
        let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!("fleet_{}_{}.db", std::process::id(), unique_id);
        Self::open(temp_dir.join(name))
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open database: {:?}", self.path))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(conn)
    }

    pub fn upsert_device(
        &self,
        device_id: &DeviceId,
        device_type: &str,
        is_online: bool,
        last_heartbeat: DateTime<Utc>,
        connected_at: DateTime<Utc>,
        disconnected_at: Option<DateTime<Utc>>,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (device_id, device_type, is_online, last_heartbeat, connected_at, disconnected_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(device_id) DO UPDATE SET
                device_type = excluded.device_type,
                is_online = excluded.is_online,
                last_heartbeat = excluded.last_heartbeat,
                connected_at = excluded.connected_at,
                disconnected_at = excluded.disconnected_at,
                metadata = excluded.metadata",
            params![
                device_id.0,
                device_type,
                is_online as i64,
                last_heartbeat.to_rfc3339(),
                connected_at.to_rfc3339(),
                disconnected_at.map(|t| t.to_rfc3339()),
                metadata.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, device_type, is_online, last_heartbeat, connected_at, disconnected_at, metadata
             FROM devices ORDER BY device_id",
        )?;
        let rows = stmt.query_map([], row_to_device)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list devices")
    }

    pub fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, device_type, is_online, last_heartbeat, connected_at, disconnected_at, metadata
             FROM devices WHERE device_id = ?1",
        )?;
        let mut rows = stmt.query(params![device_id.0])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_device(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn insert_state_snapshot(
        &self,
        device_id: &DeviceId,
        device_type: &str,
        payload: &serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO state_snapshots (device_id, device_type, payload, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![device_id.0, device_type, payload.to_string(), timestamp.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn latest_state_snapshots(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> Result<Vec<DeviceStateSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, device_type, payload, timestamp FROM state_snapshots
             WHERE device_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id.0, limit as i64], |row| {
            Ok(DeviceStateSnapshot {
                id: row.get(0)?,
                device_id: DeviceId(row.get(1)?),
                device_type: row.get(2)?,
                payload: parse_json(row.get::<_, String>(3)?),
                timestamp: parse_time(row.get::<_, String>(4)?),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read state snapshots")
    }

    pub fn create_command(
        &self,
        command_id: &crate::types::CommandId,
        device_type: &str,
        command_name: &str,
        payload: &serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<CommandRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO commands (command_id, device_type, command_name, payload, status, target_device_count, success_count, created_at)
             VALUES (?1, ?2, ?3, ?4, 'created', 0, 0, ?5)",
            params![command_id.0, device_type, command_name, payload.to_string(), created_at.to_rfc3339()],
        )?;
        self.get_command(command_id)?
            .ok_or_else(|| anyhow::anyhow!("failed to retrieve created command"))
    }

    /// Monotonic forward transition. `target_device_count` is set once the
    /// fan-out result is known; later calls may pass `None` to leave it.
    #[allow(clippy::too_many_arguments)]
    pub fn update_command_status(
        &self,
        command_id: &crate::types::CommandId,
        new_status: CommandStatus,
        target_device_count: Option<u32>,
        executed_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        response_payload: Option<&serde_json::Value>,
        success_count: Option<u32>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE commands SET
                status = ?1,
                target_device_count = COALESCE(?2, target_device_count),
                executed_at = COALESCE(?3, executed_at),
                completed_at = COALESCE(?4, completed_at),
                response_payload = COALESCE(?5, response_payload),
                success_count = COALESCE(?6, success_count)
             WHERE command_id = ?7",
            params![
                new_status.as_str(),
                target_device_count,
                executed_at.map(|t| t.to_rfc3339()),
                completed_at.map(|t| t.to_rfc3339()),
                response_payload.map(|p| p.to_string()),
                success_count,
                command_id.0,
            ],
        )?;
        Ok(())
    }

    pub fn get_command(&self, command_id: &crate::types::CommandId) -> Result<Option<CommandRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT command_id, device_type, command_name, payload, status, target_device_count, success_count, created_at, executed_at, completed_at, response_payload
             FROM commands WHERE command_id = ?1",
        )?;
        let mut rows = stmt.query(params![command_id.0])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_command(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_commands(
        &self,
        limit: usize,
        status: Option<CommandStatus>,
        device_type: Option<&str>,
    ) -> Result<Vec<CommandRecord>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT command_id, device_type, command_name, payload, status, target_device_count, success_count, created_at, executed_at, completed_at, response_payload
             FROM commands WHERE 1=1",
        );
        if status.is_some() {
            sql.push_str(" AND status = :status");
        }
        if device_type.is_some() {
            sql.push_str(" AND device_type = :device_type");
        }
        sql.push_str(" ORDER BY created_at DESC, command_id DESC LIMIT :limit");

        let mut stmt = conn.prepare(&sql)?;
        let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
        let status_str = status.map(|s| s.as_str());
        if let Some(ref s) = status_str {
            named.push((":status", s));
        }
        if let Some(t) = device_type {
            named.push((":device_type", &t));
        }
        let limit_i64 = limit as i64;
        named.push((":limit", &limit_i64));

        let rows = stmt.query_map(named.as_slice(), row_to_command)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list commands")
    }

    pub fn insert_connection_event(
        &self,
        device_id: &DeviceId,
        device_type: &str,
        kind: ConnectionEventKind,
        timestamp: DateTime<Utc>,
        details: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO connection_events (device_id, device_type, kind, timestamp, details) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![device_id.0, device_type, kind.as_str(), timestamp.to_rfc3339(), details.map(|d| d.to_string())],
        )?;
        Ok(())
    }

    pub fn connection_history(&self, device_id: &DeviceId, limit: usize) -> Result<Vec<ConnectionEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, device_type, kind, timestamp, details FROM connection_events
             WHERE device_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id.0, limit as i64], |row| {
            Ok(ConnectionEvent {
                id: row.get(0)?,
                device_id: DeviceId(row.get(1)?),
                device_type: row.get(2)?,
                kind: parse_event_kind(row.get::<_, String>(3)?),
                timestamp: parse_time(row.get::<_, String>(4)?),
                details: row.get::<_, Option<String>>(5)?.map(|s| parse_json(s)),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read connection history")
    }

    pub fn insert_transcript(&self, t: &AudioTranscript) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audio_transcripts (device_id, raw_text, normalized_text, prefix_ok, matched_command, confidence, manual, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                t.device_id.0,
                t.raw_text,
                t.normalized_text,
                t.prefix_ok as i64,
                t.matched_command,
                t.confidence,
                t.manual as i64,
                t.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn latest_transcripts(&self, limit: usize) -> Result<Vec<AudioTranscript>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, raw_text, normalized_text, prefix_ok, matched_command, confidence, manual, timestamp
             FROM audio_transcripts ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(AudioTranscript {
                id: row.get(0)?,
                device_id: DeviceId(row.get(1)?),
                raw_text: row.get(2)?,
                normalized_text: row.get(3)?,
                prefix_ok: row.get::<_, i64>(4)? != 0,
                matched_command: row.get(5)?,
                confidence: row.get(6)?,
                manual: row.get::<_, i64>(7)? != 0,
                timestamp: parse_time(row.get::<_, String>(8)?),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read transcripts")
    }
}

fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: DeviceId(row.get(0)?),
        device_type: row.get(1)?,
        is_online: row.get::<_, i64>(2)? != 0,
        last_heartbeat: parse_time(row.get::<_, String>(3)?),
        connected_at: parse_time(row.get::<_, String>(4)?),
        disconnected_at: row.get::<_, Option<String>>(5)?.map(parse_time),
        metadata: parse_json(row.get::<_, String>(6)?),
    })
}

fn row_to_command(row: &rusqlite::Row) -> rusqlite::Result<CommandRecord> {
    Ok(CommandRecord {
        command_id: crate::types::CommandId(row.get(0)?),
        device_type: row.get(1)?,
        command_name: row.get(2)?,
        payload: parse_json(row.get::<_, String>(3)?),
        status: row
            .get::<_, String>(4)?
            .parse()
            .unwrap_or(CommandStatus::Created),
        target_device_count: row.get::<_, i64>(5)? as u32,
        success_count: row.get::<_, i64>(6)? as u32,
        created_at: parse_time(row.get::<_, String>(7)?),
        executed_at: row.get::<_, Option<String>>(8)?.map(parse_time),
        completed_at: row.get::<_, Option<String>>(9)?.map(parse_time),
        response_payload: row.get::<_, Option<String>>(10)?.map(parse_json),
    })
}

fn parse_json(s: String) -> serde_json::Value {
    serde_json::from_str(&s).unwrap_or(serde_json::Value::Null)
}

fn parse_time(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_event_kind(s: String) -> ConnectionEventKind {
    match s.as_str() {
        "connected" => ConnectionEventKind::Connected,
        "disconnected" => ConnectionEventKind::Disconnected,
        "timeout" => ConnectionEventKind::Timeout,
        "reregistered" => ConnectionEventKind::Reregistered,
        _ => ConnectionEventKind::Disconnected,
    }
}

/// Async handle around `Database`, pushing each call onto the blocking pool
/// so synchronous SQLite I/O never stalls the async executor.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: Arc::new(Database::open(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Database::in_memory()?),
        })
    }

    async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Database) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("audit store task panicked")?
    }

    pub async fn upsert_device(
        &self,
        device_id: DeviceId,
        device_type: String,
        is_online: bool,
        last_heartbeat: DateTime<Utc>,
        connected_at: DateTime<Utc>,
        disconnected_at: Option<DateTime<Utc>>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.run(move |db| {
            db.upsert_device(
                &device_id,
                &device_type,
                is_online,
                last_heartbeat,
                connected_at,
                disconnected_at,
                &metadata,
            )
        })
        .await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        self.run(|db| db.list_devices()).await
    }

    pub async fn insert_state_snapshot(
        &self,
        device_id: DeviceId,
        device_type: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.run(move |db| db.insert_state_snapshot(&device_id, &device_type, &payload, timestamp))
            .await
    }

    pub async fn latest_state_snapshots(
        &self,
        device_id: DeviceId,
        limit: usize,
    ) -> Result<Vec<DeviceStateSnapshot>> {
        self.run(move |db| db.latest_state_snapshots(&device_id, limit)).await
    }

    pub async fn create_command(
        &self,
        command_id: crate::types::CommandId,
        device_type: String,
        command_name: String,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<CommandRecord> {
        self.run(move |db| db.create_command(&command_id, &device_type, &command_name, &payload, created_at))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_command_status(
        &self,
        command_id: crate::types::CommandId,
        new_status: CommandStatus,
        target_device_count: Option<u32>,
        executed_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        response_payload: Option<serde_json::Value>,
        success_count: Option<u32>,
    ) -> Result<()> {
        self.run(move |db| {
            db.update_command_status(
                &command_id,
                new_status,
                target_device_count,
                executed_at,
                completed_at,
                response_payload.as_ref(),
                success_count,
            )
        })
        .await
    }

    pub async fn get_command(&self, command_id: crate::types::CommandId) -> Result<Option<CommandRecord>> {
        self.run(move |db| db.get_command(&command_id)).await
    }

    pub async fn list_commands(
        &self,
        limit: usize,
        status: Option<CommandStatus>,
        device_type: Option<String>,
    ) -> Result<Vec<CommandRecord>> {
        self.run(move |db| db.list_commands(limit, status, device_type.as_deref()))
            .await
    }

    pub async fn insert_connection_event(
        &self,
        device_id: DeviceId,
        device_type: String,
        kind: ConnectionEventKind,
        timestamp: DateTime<Utc>,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        self.run(move |db| {
            db.insert_connection_event(&device_id, &device_type, kind, timestamp, details.as_ref())
        })
        .await
    }

    pub async fn connection_history(&self, device_id: DeviceId, limit: usize) -> Result<Vec<ConnectionEvent>> {
        self.run(move |db| db.connection_history(&device_id, limit)).await
    }

    pub async fn insert_transcript(&self, transcript: AudioTranscript) -> Result<()> {
        self.run(move |db| db.insert_transcript(&transcript)).await
    }

    pub async fn latest_transcripts(&self, limit: usize) -> Result<Vec<AudioTranscript>> {
        self.run(move |db| db.latest_transcripts(limit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_upsert_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let id = DeviceId::from("wheelcontroller");

        db.upsert_device(&id, "wheel", true, now, now, None, &json!({"fw": 1}))
            .unwrap();
        db.upsert_device(&id, "wheel", true, now, now, None, &json!({"fw": 2}))
            .unwrap();

        let devices = db.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].metadata, json!({"fw": 2}));
    }

    #[test]
    fn command_lifecycle_transitions() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let id = crate::types::CommandId::new();

        db.create_command(&id, "wheel", "forward", &json!({"speed": 200}), now)
            .unwrap();
        db.update_command_status(&id, CommandStatus::Sent, Some(1), Some(now), None, None, None)
            .unwrap();
        db.update_command_status(
            &id,
            CommandStatus::AckSuccess,
            None,
            None,
            Some(now),
            None,
            Some(1),
        )
        .unwrap();

        let record = db.get_command(&id).unwrap().unwrap();
        assert_eq!(record.status, CommandStatus::AckSuccess);
        assert_eq!(record.target_device_count, 1);
        assert_eq!(record.success_count, 1);
    }

    #[test]
    fn transcripts_and_events_round_trip() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let id = DeviceId::from("camcontroller");

        db.insert_connection_event(&id, "audio", ConnectionEventKind::Connected, now, None)
            .unwrap();
        let history = db.connection_history(&id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, ConnectionEventKind::Connected);

        db.insert_transcript(&AudioTranscript {
            id: 0,
            device_id: id.clone(),
            raw_text: "ESP move forward".into(),
            normalized_text: "ESP MOVE FORWARD".into(),
            prefix_ok: true,
            matched_command: Some("forward".into()),
            confidence: Some(0.92),
            manual: false,
            timestamp: now,
        })
        .unwrap();

        let transcripts = db.latest_transcripts(10).unwrap();
        assert_eq!(transcripts.len(), 1);
        assert_eq!(transcripts[0].matched_command.as_deref(), Some("forward"));
    }
}
