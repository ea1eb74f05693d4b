//! # Hub Configuration
//!
//! Settings are layered, later sources winning field by field:
//! 1. built-in defaults
//! 2. a JSON file (`--config`, `HAPPENING_CONFIG`, or `happening.json` when present)
//! 3. environment variables (`.env` is loaded first)
//! 4. command-line flags
//!
//! [`ConfigArgs`] is the sparse, all-optional form every layer produces;
//! [`HubConfig`] is the resolved and validated result.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::event::MSG_DELIMITER;
use crate::core::ingestion::IngestionSettings;

/// File looked up in the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "happening.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[command(about = "TCP event ingestion hub", version)]
#[serde(rename_all = "camelCase")]
pub struct ConfigArgs {
    #[arg(long, env = "HAPPENING_CONFIG", help = "Path to the JSON configuration file.")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "HAPPENING_HOST", help = "Interface both services bind to.")]
    pub host: Option<String>,

    #[arg(long, env = "HAPPENING_EVENTS_PORT", help = "Port of the events ingestion service.")]
    pub events_port: Option<u16>,

    #[arg(long, env = "HAPPENING_CLIENTS_PORT", help = "Port of the client registry service.")]
    pub clients_port: Option<u16>,

    #[arg(long, help = "Initial event queue capacity, also its growth step.")]
    pub queue_capacity: Option<usize>,

    #[arg(long, help = "Upper bound in milliseconds of a single accept wait.")]
    pub accept_timeout_ms: Option<u64>,

    #[arg(long, help = "Upper bound in milliseconds of a single read on an events connection.")]
    pub read_timeout_ms: Option<u64>,

    #[arg(long, help = "Milliseconds a client has to send its id.")]
    pub registration_timeout_ms: Option<u64>,

    #[arg(long, help = "Size in bytes of the per-connection read buffer.")]
    pub read_buffer_size: Option<usize>,

    #[arg(long, help = "Longest incomplete record kept between reads, in bytes.")]
    pub max_record_bytes: Option<usize>,

    #[arg(long, help = "Events a broadcast subscriber may fall behind before losing the oldest.")]
    pub broadcast_capacity: Option<usize>,

    #[arg(long, help = "Milliseconds between two archive flushes.")]
    pub archive_interval_ms: Option<u64>,

    #[arg(long, env = "HAPPENING_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "HAPPENING_LOG_DIR", help = "Directory for JSON log files; console only when unset.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "HAPPENING_STORAGE_PATH", help = "Directory of the SQLite archive; in-memory when unset.")]
    pub storage_path: Option<PathBuf>,
}

impl ConfigArgs {
    // `other` overrides `self` wherever it has a value.
    fn merge(self, other: ConfigArgs) -> ConfigArgs {
        ConfigArgs {
            config: other.config.or(self.config),
            host: other.host.or(self.host),
            events_port: other.events_port.or(self.events_port),
            clients_port: other.clients_port.or(self.clients_port),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            accept_timeout_ms: other.accept_timeout_ms.or(self.accept_timeout_ms),
            read_timeout_ms: other.read_timeout_ms.or(self.read_timeout_ms),
            registration_timeout_ms: other.registration_timeout_ms.or(self.registration_timeout_ms),
            read_buffer_size: other.read_buffer_size.or(self.read_buffer_size),
            max_record_bytes: other.max_record_bytes.or(self.max_record_bytes),
            broadcast_capacity: other.broadcast_capacity.or(self.broadcast_capacity),
            archive_interval_ms: other.archive_interval_ms.or(self.archive_interval_ms),
            log_level: other.log_level.or(self.log_level),
            log_dir: other.log_dir.or(self.log_dir),
            storage_path: other.storage_path.or(self.storage_path),
        }
    }
}

/// Resolved hub settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub host: String,
    pub events_port: u16,
    pub clients_port: u16,
    pub queue_capacity: usize,
    pub accept_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub registration_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub max_record_bytes: usize,
    pub broadcast_capacity: usize,
    pub archive_interval_ms: u64,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub storage_path: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            events_port: 4040,
            clients_port: 4041,
            queue_capacity: 4096,
            accept_timeout_ms: 1_000,
            read_timeout_ms: 30_000,
            registration_timeout_ms: 5_000,
            read_buffer_size: 4096,
            max_record_bytes: 64 * 1024,
            broadcast_capacity: 1024,
            archive_interval_ms: 1_000,
            log_level: "info".to_string(),
            log_dir: None,
            storage_path: None,
        }
    }
}

impl HubConfig {
    /// Resolves `cli` (flags and environment) over the config file over defaults.
    pub fn from_args(cli: ConfigArgs) -> Result<Self, ConfigError> {
        let file_args = read_config_file(cli.config.as_deref()).unwrap_or_default();
        let merged = file_args.merge(cli);
        let config = Self::default().apply(merged);
        config.validate()?;
        Ok(config)
    }

    fn apply(self, args: ConfigArgs) -> Self {
        Self {
            host: args.host.unwrap_or(self.host),
            events_port: args.events_port.unwrap_or(self.events_port),
            clients_port: args.clients_port.unwrap_or(self.clients_port),
            queue_capacity: args.queue_capacity.unwrap_or(self.queue_capacity),
            accept_timeout_ms: args.accept_timeout_ms.unwrap_or(self.accept_timeout_ms),
            read_timeout_ms: args.read_timeout_ms.unwrap_or(self.read_timeout_ms),
            registration_timeout_ms: args.registration_timeout_ms.unwrap_or(self.registration_timeout_ms),
            read_buffer_size: args.read_buffer_size.unwrap_or(self.read_buffer_size),
            max_record_bytes: args.max_record_bytes.unwrap_or(self.max_record_bytes),
            broadcast_capacity: args.broadcast_capacity.unwrap_or(self.broadcast_capacity),
            archive_interval_ms: args.archive_interval_ms.unwrap_or(self.archive_interval_ms),
            log_level: args.log_level.unwrap_or(self.log_level),
            log_dir: args.log_dir.or(self.log_dir),
            storage_path: args.storage_path.or(self.storage_path),
        }
    }

    /// Rejects settings the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("queueCapacity", self.queue_capacity as u64),
            ("acceptTimeoutMs", self.accept_timeout_ms),
            ("readTimeoutMs", self.read_timeout_ms),
            ("registrationTimeoutMs", self.registration_timeout_ms),
            ("readBufferSize", self.read_buffer_size as u64),
            ("broadcastCapacity", self.broadcast_capacity as u64),
            ("archiveIntervalMs", self.archive_interval_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.max_record_bytes <= MSG_DELIMITER.len() {
            return Err(ConfigError::Invalid(format!(
                "maxRecordBytes must exceed the {}-byte delimiter",
                MSG_DELIMITER.len()
            )));
        }
        if self.events_port != 0 && self.events_port == self.clients_port {
            return Err(ConfigError::Invalid(format!(
                "eventsPort and clientsPort are both {}",
                self.events_port
            )));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        Ok(())
    }

    /// `host:port` of the events service.
    pub fn events_endpoint(&self) -> String {
        endpoint(&self.host, self.events_port)
    }

    /// `host:port` of the clients service.
    pub fn clients_endpoint(&self) -> String {
        endpoint(&self.host, self.clients_port)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_millis(self.archive_interval_ms)
    }

    pub fn ingestion_settings(&self) -> IngestionSettings {
        IngestionSettings {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            read_buffer_size: self.read_buffer_size,
            max_record_bytes: self.max_record_bytes,
            queue_capacity: self.queue_capacity,
            broadcast_capacity: self.broadcast_capacity,
        }
    }
}

fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

// Logging is not up yet when this runs, so problems go to stderr.
fn read_config_file(explicit: Option<&Path>) -> Option<ConfigArgs> {
    let path = explicit.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), Path::to_path_buf);
    if !path.exists() {
        if explicit.is_some() {
            eprintln!("Config file {} not found, using defaults and environment/CLI values.", path.display());
        }
        return None;
    }

    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<ConfigArgs>(&text) {
        Ok(args) => Some(args),
        Err(e) => {
            eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Loads `.env`, parses flags and environment, and resolves the full configuration.
pub fn load_config() -> Result<HubConfig, ConfigError> {
    let _ = dotenvy::dotenv();
    HubConfig::from_args(ConfigArgs::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args_with_file(path: &Path) -> ConfigArgs {
        ConfigArgs {
            config: Some(path.to_path_buf()),
            ..ConfigArgs::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.events_endpoint(), "127.0.0.1:4040");
        assert_eq!(config.clients_endpoint(), "127.0.0.1:4041");
    }

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"eventsPort": 5050, "queueCapacity": 16, "logLevel": "debug"}}"#).unwrap();

        let cli = ConfigArgs {
            events_port: Some(6060),
            ..args_with_file(file.path())
        };
        let config = HubConfig::from_args(cli).unwrap();

        assert_eq!(config.events_port, 6060);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.clients_port, 4041);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let config = HubConfig::from_args(args_with_file(file.path())).unwrap();
        assert_eq!(config, HubConfig::default());
    }

    #[test]
    fn zero_values_are_rejected() {
        let config = HubConfig {
            read_timeout_ms: 0,
            ..HubConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid("readTimeoutMs must be greater than zero".to_string()))
        );
    }

    #[test]
    fn shared_port_is_rejected_unless_ephemeral() {
        let clash = HubConfig {
            clients_port: 4040,
            ..HubConfig::default()
        };
        assert!(clash.validate().is_err());

        let ephemeral = HubConfig {
            events_port: 0,
            clients_port: 0,
            ..HubConfig::default()
        };
        assert!(ephemeral.validate().is_ok());
    }

    #[test]
    fn tiny_record_bound_is_rejected() {
        let config = HubConfig {
            max_record_bytes: 2,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let config = HubConfig {
            host: "::1".to_string(),
            ..HubConfig::default()
        };
        assert_eq!(config.events_endpoint(), "[::1]:4040");
    }
}
