//! Application configuration (TOML-based)
//!
//! Loaded from `~/.config/ocpp-emulator/config.toml` (overridable with
//! `OCPP_EMU_CONFIG`). Every section has defaults so a missing file yields
//! a runnable configuration; an unparseable or invalid file is refused at
//! the boundary and the process exits with status 1.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DomainError, DomainResult, StationConfig};
use crate::ocpp::ValidationMode;
use crate::station::StationDefaults;
use crate::transport::{BackoffPolicy, TlsSettings};

/// Default configuration path: `~/.config/ocpp-emulator/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-emulator")
        .join("config.toml")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address of the health/metrics listener
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// debug | info | warn | error
    pub level: String,
    /// json | text
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Document-store URI. Empty or `memory://` selects the built-in
    /// in-memory store; any other scheme needs a host-layer store adapter
    /// and is refused at startup.
    pub uri: String,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.uri.is_empty() || self.uri == "memory://"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsmsConfig {
    /// Default CSMS URL for stations that do not set their own
    pub default_url: String,
    pub connection_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// 0 = retry forever
    pub max_reconnect_attempts: u32,
    pub reconnect_initial_secs: u64,
    pub reconnect_max_secs: u64,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            default_url: "ws://localhost:9000/ocpp".to_string(),
            connection_timeout_secs: 10,
            heartbeat_interval_secs: 300,
            request_timeout_secs: 30,
            max_reconnect_attempts: 0,
            reconnect_initial_secs: 5,
            reconnect_max_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 0 = unlimited
    pub max_stations: usize,
    pub cache_ttl_secs: u64,
    pub message_buffer_size: usize,
    pub batch_size: usize,
    pub batch_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Strict payload validation rejects unknown fields
    pub strict_validation: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            max_stations: 0,
            cache_ttl_secs: 300,
            message_buffer_size: 1_000,
            batch_size: 100,
            batch_interval_secs: 5,
            sync_interval_secs: 30,
            shutdown_timeout_secs: 30,
            strict_validation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub csms: CsmsConfig,
    pub tls: TlsConfig,
    pub app: AppSection,
    /// Stations seeded at startup (the richer scripted loader is an
    /// external collaborator; this covers the standalone binary)
    pub stations: Vec<StationConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> DomainResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DomainError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| DomainError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DomainResult<()> {
        match self.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(DomainError::InvalidConfig(format!(
                    "unknown log level '{}'",
                    other
                )))
            }
        }
        match self.logging.format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(DomainError::InvalidConfig(format!(
                    "unknown log format '{}'",
                    other
                )))
            }
        }
        if !self.database.is_memory() {
            // Startup failure: the binary ships only the in-memory store,
            // concrete database bindings live in the host layer
            return Err(DomainError::InvalidConfig(format!(
                "no store adapter built in for '{}'; use memory:// or attach one in the host layer",
                self.database.uri
            )));
        }
        if self.csms.reconnect_initial_secs == 0 {
            return Err(DomainError::InvalidConfig(
                "reconnect_initial_secs must be positive".into(),
            ));
        }
        if self.csms.reconnect_max_secs < self.csms.reconnect_initial_secs {
            return Err(DomainError::InvalidConfig(
                "reconnect_max_secs must be >= reconnect_initial_secs".into(),
            ));
        }
        for station in &self.stations {
            station.validate()?;
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn validation_mode(&self) -> ValidationMode {
        if self.app.strict_validation {
            ValidationMode::Strict
        } else {
            ValidationMode::Lenient
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.csms.request_timeout_secs.max(1))
    }

    /// Transport defaults handed to every station.
    pub fn station_defaults(&self) -> StationDefaults {
        StationDefaults {
            connect_timeout: Duration::from_secs(self.csms.connection_timeout_secs.max(1)),
            queue_capacity: 100,
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy {
                initial: Duration::from_secs(self.csms.reconnect_initial_secs),
                cap: Duration::from_secs(self.csms.reconnect_max_secs),
                max_attempts: self.csms.max_reconnect_attempts,
            },
            tls: TlsSettings {
                enabled: self.tls.enabled,
                ca_cert_path: self.tls.ca_cert.clone(),
                client_cert_path: self.tls.client_cert.clone(),
                client_key_path: self.tls.client_key.clone(),
                insecure_skip_verify: self.tls.insecure_skip_verify,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_a_full_config() {
        let text = r#"
            [server]
            host = "127.0.0.1"
            port = 9200

            [logging]
            level = "debug"
            format = "json"

            [csms]
            default_url = "ws://csms.example:8080/ocpp"
            max_reconnect_attempts = 5
            reconnect_initial_secs = 1
            reconnect_max_secs = 8

            [app]
            message_buffer_size = 500
            strict_validation = true

            [[stations]]
            id = "CP-1"
            name = "First"
            enabled = true
            auto_start = true
            protocol_version = "1.6"
            vendor = "Voltsim"
            model = "EMU-1"
            csms_url = "ws://csms.example:8080/ocpp"
            connectors = [{ id = 1, max_power_w = 22000.0 }]
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.bind_address(), "127.0.0.1:9200");
        assert_eq!(config.validation_mode(), ValidationMode::Strict);
        assert_eq!(config.stations.len(), 1);
        assert_eq!(config.stations[0].connectors[0].id, 1);

        let defaults = config.station_defaults();
        assert_eq!(defaults.backoff.max_attempts, 5);
        assert_eq!(defaults.backoff.initial, Duration::from_secs(1));
        assert_eq!(defaults.backoff.cap, Duration::from_secs(8));
    }

    #[test]
    fn memory_database_uri_accepted() {
        let mut config = AppConfig::default();
        config.database.uri = "memory://".into();
        config.validate().unwrap();
    }

    #[test]
    fn foreign_database_uri_refused_at_startup() {
        let mut config = AppConfig::default();
        config.database.uri = "mongodb://localhost:27017/emu".into();
        assert!(matches!(
            config.validate(),
            Err(DomainError::InvalidConfig(_))
        ));
    }

    #[test]
    fn bad_log_level_rejected() {
        let mut config = AppConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_backoff_rejected() {
        let mut config = AppConfig::default();
        config.csms.reconnect_initial_secs = 30;
        config.csms.reconnect_max_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_seeded_station_rejected() {
        let text = r#"
            [[stations]]
            id = ""
            name = "bad"
            enabled = true
            auto_start = false
            protocol_version = "1.6"
            vendor = "V"
            model = "M"
            csms_url = "ws://x/ocpp"
            connectors = []
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }
}
