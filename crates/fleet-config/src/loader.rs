//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, ServerConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations, optionally with a CLI
/// override path. Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/fleetd/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("fleetd/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("fleetd.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file, applied as an overlay onto `base`.
pub fn load_from_file(base: ServerConfig, path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_toml_overlay(base, &contents, path)
}

fn parse_toml_overlay(
    mut config: ServerConfig,
    contents: &str,
    path: &Path,
) -> Result<ServerConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if let Some(v) = table.get("listen_host").and_then(|v| v.as_str()) {
        config.listen_host = v.to_string();
    }
    if let Some(v) = table.get("listen_port").and_then(|v| v.as_integer()) {
        config.listen_port = v as u16;
    }
    if let Some(v) = table.get("heartbeat_timeout_seconds").and_then(|v| v.as_integer()) {
        config.heartbeat_timeout_seconds = v as u64;
    }
    if let Some(v) = table.get("reaper_interval_seconds").and_then(|v| v.as_integer()) {
        config.reaper_interval_seconds = v as u64;
    }
    if let Some(v) = table
        .get("command_ack_timeout_seconds")
        .and_then(|v| v.as_integer())
    {
        config.command_ack_timeout_seconds = v as u64;
    }
    if let Some(v) = table.get("audio_sample_rate").and_then(|v| v.as_integer()) {
        config.audio_sample_rate = v as u32;
    }
    if let Some(v) = table.get("prefix_phrases").and_then(|v| v.as_array()) {
        config.prefix_phrases = v
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect();
    }
    if let Some(v) = table.get("confidence_threshold").and_then(|v| v.as_float()) {
        config.confidence_threshold = v;
    }
    if let Some(v) = table.get("outbound_queue_capacity").and_then(|v| v.as_integer()) {
        config.outbound_queue_capacity = v as usize;
    }
    if let Some(v) = table.get("database_path").and_then(|v| v.as_str()) {
        config.database_path = expand_path(v);
    }
    if let Some(v) = table.get("read_limit_default").and_then(|v| v.as_integer()) {
        config.read_limit_default = v as usize;
    }
    if let Some(v) = table.get("read_limit_max").and_then(|v| v.as_integer()) {
        config.read_limit_max = v as usize;
    }
    if let Some(v) = table.get("request_timeout_seconds").and_then(|v| v.as_integer()) {
        config.request_timeout_seconds = v as u64;
    }
    if let Some(v) = table.get("reserved_device_ids").and_then(|v| v.as_array()) {
        config.reserved_device_ids = v
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect();
    }
    if let Some(v) = table.get("log_level").and_then(|v| v.as_str()) {
        config.log_level = v.to_string();
    }

    Ok(config)
}

/// Apply `FLEET_*` environment variable overrides to `config`.
pub fn apply_env_overrides(config: &mut ServerConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("FLEET_LISTEN_HOST") {
        config.listen_host = v;
        sources.env_overrides.push("FLEET_LISTEN_HOST".to_string());
    }
    if let Ok(v) = env::var("FLEET_LISTEN_PORT") {
        if let Ok(port) = v.parse() {
            config.listen_port = port;
            sources.env_overrides.push("FLEET_LISTEN_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("FLEET_HEARTBEAT_TIMEOUT_SECONDS") {
        if let Ok(secs) = v.parse() {
            config.heartbeat_timeout_seconds = secs;
            sources
                .env_overrides
                .push("FLEET_HEARTBEAT_TIMEOUT_SECONDS".to_string());
        }
    }
    if let Ok(v) = env::var("FLEET_REAPER_INTERVAL_SECONDS") {
        if let Ok(secs) = v.parse() {
            config.reaper_interval_seconds = secs;
            sources
                .env_overrides
                .push("FLEET_REAPER_INTERVAL_SECONDS".to_string());
        }
    }
    if let Ok(v) = env::var("FLEET_COMMAND_ACK_TIMEOUT_SECONDS") {
        if let Ok(secs) = v.parse() {
            config.command_ack_timeout_seconds = secs;
            sources
                .env_overrides
                .push("FLEET_COMMAND_ACK_TIMEOUT_SECONDS".to_string());
        }
    }
    if let Ok(v) = env::var("FLEET_AUDIO_SAMPLE_RATE") {
        if let Ok(rate) = v.parse() {
            config.audio_sample_rate = rate;
            sources
                .env_overrides
                .push("FLEET_AUDIO_SAMPLE_RATE".to_string());
        }
    }
    if let Ok(v) = env::var("FLEET_PREFIX_PHRASES") {
        config.prefix_phrases = v.split(',').map(|s| s.trim().to_string()).collect();
        sources.env_overrides.push("FLEET_PREFIX_PHRASES".to_string());
    }
    if let Ok(v) = env::var("FLEET_CONFIDENCE_THRESHOLD") {
        if let Ok(threshold) = v.parse() {
            config.confidence_threshold = threshold;
            sources
                .env_overrides
                .push("FLEET_CONFIDENCE_THRESHOLD".to_string());
        }
    }
    if let Ok(v) = env::var("FLEET_OUTBOUND_QUEUE_CAPACITY") {
        if let Ok(cap) = v.parse() {
            config.outbound_queue_capacity = cap;
            sources
                .env_overrides
                .push("FLEET_OUTBOUND_QUEUE_CAPACITY".to_string());
        }
    }
    if let Ok(v) = env::var("FLEET_DATABASE_PATH") {
        config.database_path = expand_path(&v);
        sources.env_overrides.push("FLEET_DATABASE_PATH".to_string());
    }
    if let Ok(v) = env::var("FLEET_LOG_LEVEL") {
        config.log_level = v;
        sources.env_overrides.push("FLEET_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand `~` and `$VAR` in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                return PathBuf::from(var_value).join(&stripped[slash_pos + 1..]);
            }
        } else if let Ok(var_value) = env::var(stripped) {
            return PathBuf::from(var_value);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn parse_partial_toml_overlay() {
        let toml = r#"
listen_port = 9090
prefix_phrases = ["HEY ROBOT"]
"#;
        let config =
            parse_toml_overlay(ServerConfig::default(), toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.listen_port, 9090);
        assert_eq!(config.prefix_phrases, vec!["HEY ROBOT".to_string()]);
        // Untouched fields keep their defaults.
        assert_eq!(
            config.heartbeat_timeout_seconds,
            ServerConfig::default_heartbeat_timeout_seconds()
        );
    }

    #[test]
    fn discover_config_files_does_not_panic() {
        let _files = discover_config_files_with_override(None);
    }
}
