/*!
 * Configuration for the pulsar client and Star
 */

use pulsar_connect::DispatchConfig;
use pulsar_star::StarConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PulsarError, Result};

/// Default config file, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "pulsar.toml";

/// Contents of `pulsar.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulsarConfig {
    /// Fleet membership, required
    pub client: ClientConfig,

    #[serde(default)]
    pub server: StarConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Ordered peer list (`host:port`). The client talks to the first entry;
    /// every Star stripes batches across all of them.
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// JSON-lines log file (None = compact output on stderr)
    pub file: Option<PathBuf>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl PulsarConfig {
    /// Loads and validates a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PulsarError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
            .map_err(|e| PulsarError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parses and validates TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: PulsarConfig =
            toml::from_str(contents).map_err(|e| PulsarError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client.servers.is_empty() {
            return Err(PulsarError::Config(
                "client.servers must list at least one server".to_string(),
            ));
        }
        if let Some(bad) = self.client.servers.iter().find(|s| !s.contains(':')) {
            return Err(PulsarError::Config(format!(
                "server address {bad:?} is not host:port"
            )));
        }
        if self.server.walk_channel_capacity == 0 {
            return Err(PulsarError::Config(
                "server.walk_channel_capacity must be at least 1".to_string(),
            ));
        }
        let dispatch = &self.dispatch;
        if dispatch.max_batch_paths == 0 || dispatch.max_batch_bytes == 0 {
            return Err(PulsarError::Config(
                "dispatch.max_batch_paths and dispatch.max_batch_bytes must be at least 1".to_string(),
            ));
        }
        if dispatch.max_batch_bytes >= dispatch.max_frame_len {
            return Err(PulsarError::Config(format!(
                "dispatch.max_batch_bytes ({}) must be below dispatch.max_frame_len ({})",
                dispatch.max_batch_bytes, dispatch.max_frame_len
            )));
        }
        Ok(())
    }

    /// The server the client submits to.
    pub fn primary_server(&self) -> Option<&str> {
        self.client.servers.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = PulsarConfig::from_toml(
            r#"
            [client]
            servers = ["10.0.0.1:1234", "10.0.0.2:1234"]
            "#,
        )
        .unwrap();

        assert_eq!(config.primary_server(), Some("10.0.0.1:1234"));
        assert_eq!(config.server, StarConfig::default());
        assert_eq!(config.dispatch, DispatchConfig::default());
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_batch_budget_must_fit_in_a_frame() {
        let err = PulsarConfig::from_toml(
            r#"
            [client]
            servers = ["a:1"]
            [dispatch]
            max_frame_len = 1024
            max_batch_bytes = 4096
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_batch_bytes"), "{err}");

        assert!(PulsarConfig::from_toml(
            "[client]\nservers = [\"a:1\"]\n[dispatch]\nmax_batch_paths = 0\n"
        )
        .is_err());
    }

    #[test]
    fn test_full_config() {
        let config = PulsarConfig::from_toml(
            r#"
            [client]
            servers = ["a:1"]

            [server]
            bind = "127.0.0.1"
            port = 4321
            copy_concurrency = 8

            [dispatch]
            max_retries = 5
            connect_timeout_ms = 250

            [logging]
            level = "debug"
            file = "/var/log/pulsar.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_address(), "127.0.0.1:4321");
        assert_eq!(config.server.copy_concurrency, 8);
        assert_eq!(config.dispatch.retry.max_retries, 5);
        assert_eq!(config.dispatch.connect_timeout_ms, 250);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(
            config.logging.file,
            Some(PathBuf::from("/var/log/pulsar.json"))
        );
    }

    #[test]
    fn test_empty_server_list_rejected() {
        let err = PulsarConfig::from_toml("[client]\nservers = []\n").unwrap_err();
        assert!(matches!(err, PulsarError::Config(_)));
    }

    #[test]
    fn test_missing_client_section_rejected() {
        assert!(PulsarConfig::from_toml("[server]\nport = 1\n").is_err());
    }

    #[test]
    fn test_address_without_port_rejected() {
        let err = PulsarConfig::from_toml("[client]\nservers = [\"localhost\"]\n").unwrap_err();
        assert!(err.to_string().contains("host:port"));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
