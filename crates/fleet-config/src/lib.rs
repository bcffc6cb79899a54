//! Minimal configuration loading for the fleet coordination server.
//!
//! Configuration is loaded from (in order, later wins):
//! 1. Compiled defaults
//! 2. `/etc/fleetd/config.toml` (system)
//! 3. `~/.config/fleetd/config.toml` (user)
//! 4. `./fleetd.toml` (local override, or `--config` path)
//! 5. Environment variables (`FLEET_*`, plus `RUST_LOG`)
//!
//! # Example
//!
//! ```rust,no_run
//! use fleet_config::ServerConfig;
//!
//! let config = ServerConfig::load().expect("failed to load config");
//! println!("listening on {}:{}", config.listen_host, config.listen_port);
//! ```
//!
//! ```toml
//! listen_host = "0.0.0.0"
//! listen_port = 8088
//! heartbeat_timeout_seconds = 90
//! prefix_phrases = ["ESP", "NATIONAL PG"]
//! database_path = "~/.local/share/fleetd/fleet.db"
//! ```

mod loader;
mod schema;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use schema::ServerConfig;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl ServerConfig {
    /// Load configuration from all sources using the default search path.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, optionally pinning the local override file to
    /// `config_path` (as a `--config` CLI flag would), returning a record of
    /// which files and environment variables contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = ServerConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            config = loader::load_from_file(config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_recommendations() {
        let config = ServerConfig::default();
        assert_eq!(config.heartbeat_timeout_seconds, 90);
        assert_eq!(config.reaper_interval_seconds, 10);
        assert_eq!(config.command_ack_timeout_seconds, 30);
        assert_eq!(config.audio_sample_rate, 16_000);
        assert_eq!(config.outbound_queue_capacity, 64);
        assert!((config.confidence_threshold - 0.70).abs() < f64::EPSILON);
        assert!(config.reserved_device_ids.contains(&"dashboard".to_string()));
    }

    #[test]
    fn load_without_any_files_still_succeeds() {
        let config = ServerConfig::load().unwrap();
        assert_eq!(config.listen_port, 8088);
    }
}
