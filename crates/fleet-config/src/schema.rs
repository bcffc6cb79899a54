//! Configuration schema - server binding, liveness, and pipeline tuning.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface the HTTP/websocket listener binds to.
    #[serde(default = "ServerConfig::default_listen_host")]
    pub listen_host: String,

    /// Port the HTTP/websocket listener binds to.
    #[serde(default = "ServerConfig::default_listen_port")]
    pub listen_port: u16,

    /// Seconds of silence from an online device before the reaper marks it offline.
    #[serde(default = "ServerConfig::default_heartbeat_timeout_seconds")]
    pub heartbeat_timeout_seconds: u64,

    /// How often the heartbeat reaper scans the registry.
    #[serde(default = "ServerConfig::default_reaper_interval_seconds")]
    pub reaper_interval_seconds: u64,

    /// Deadline for a dispatched command to collect all expected acks.
    #[serde(default = "ServerConfig::default_command_ack_timeout_seconds")]
    pub command_ack_timeout_seconds: u64,

    /// Expected sample rate of uploaded PCM audio (16-bit LE mono).
    #[serde(default = "ServerConfig::default_audio_sample_rate")]
    pub audio_sample_rate: u32,

    /// Wake phrases the prefix gate accepts at the start of normalised text.
    #[serde(default = "ServerConfig::default_prefix_phrases")]
    pub prefix_phrases: Vec<String>,

    /// Minimum fuzzy-match confidence to accept an intent.
    #[serde(default = "ServerConfig::default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Per-session bounded outbound queue capacity.
    #[serde(default = "ServerConfig::default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// SQLite database file for the audit store.
    #[serde(default = "ServerConfig::default_database_path")]
    pub database_path: PathBuf,

    /// Default page size for read-side list endpoints.
    #[serde(default = "ServerConfig::default_read_limit_default")]
    pub read_limit_default: usize,

    /// Maximum page size a caller may request from a read-side endpoint.
    #[serde(default = "ServerConfig::default_read_limit_max")]
    pub read_limit_max: usize,

    /// Per-HTTP-request deadline, bounding external-collaborator latency.
    #[serde(default = "ServerConfig::default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Device identifiers refused at session accept (impersonation guard).
    #[serde(default = "ServerConfig::default_reserved_device_ids")]
    pub reserved_device_ids: Vec<String>,

    /// `tracing_subscriber::EnvFilter` directive, overridable by `RUST_LOG`.
    #[serde(default = "ServerConfig::default_log_level")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn default_listen_host() -> String {
        "0.0.0.0".to_string()
    }

    pub fn default_listen_port() -> u16 {
        8088
    }

    pub fn default_heartbeat_timeout_seconds() -> u64 {
        90
    }

    pub fn default_reaper_interval_seconds() -> u64 {
        10
    }

    pub fn default_command_ack_timeout_seconds() -> u64 {
        30
    }

    pub fn default_audio_sample_rate() -> u32 {
        16_000
    }

    pub fn default_prefix_phrases() -> Vec<String> {
        vec!["ESP".to_string(), "NATIONAL PG".to_string()]
    }

    pub fn default_confidence_threshold() -> f64 {
        0.70
    }

    pub fn default_outbound_queue_capacity() -> usize {
        64
    }

    pub fn default_database_path() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/fleetd/fleet.db"))
            .unwrap_or_else(|| PathBuf::from(".local/share/fleetd/fleet.db"))
    }

    pub fn default_read_limit_default() -> usize {
        50
    }

    pub fn default_read_limit_max() -> usize {
        500
    }

    pub fn default_request_timeout_seconds() -> u64 {
        60
    }

    pub fn default_reserved_device_ids() -> Vec<String> {
        vec![
            "dashboard".to_string(),
            "browser".to_string(),
            "servo".to_string(),
            "operator".to_string(),
            "admin".to_string(),
        ]
    }

    pub fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: Self::default_listen_host(),
            listen_port: Self::default_listen_port(),
            heartbeat_timeout_seconds: Self::default_heartbeat_timeout_seconds(),
            reaper_interval_seconds: Self::default_reaper_interval_seconds(),
            command_ack_timeout_seconds: Self::default_command_ack_timeout_seconds(),
            audio_sample_rate: Self::default_audio_sample_rate(),
            prefix_phrases: Self::default_prefix_phrases(),
            confidence_threshold: Self::default_confidence_threshold(),
            outbound_queue_capacity: Self::default_outbound_queue_capacity(),
            database_path: Self::default_database_path(),
            read_limit_default: Self::default_read_limit_default(),
            read_limit_max: Self::default_read_limit_max(),
            request_timeout_seconds: Self::default_request_timeout_seconds(),
            reserved_device_ids: Self::default_reserved_device_ids(),
            log_level: Self::default_log_level(),
        }
    }
}
