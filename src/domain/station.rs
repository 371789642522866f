//! Station configuration and runtime state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{DomainError, DomainResult};
use super::version::OcppVersion;

// ── Configuration (durable, authored) ──────────────────────────

/// Durable station configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Station identifier, unique across the registry
    pub id: String,
    /// Display name
    pub name: String,
    /// Disabled stations are never started
    pub enabled: bool,
    /// Start the station as soon as it is registered
    pub auto_start: bool,
    /// OCPP protocol version spoken on the wire
    pub protocol_version: OcppVersion,
    pub vendor: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    /// Ordered connector descriptors; ids unique and ≥ 1
    pub connectors: Vec<ConnectorConfig>,
    /// Supported OCPP feature profiles (e.g. "Core", "RemoteTrigger")
    #[serde(default)]
    pub feature_profiles: Vec<String>,
    #[serde(default)]
    pub meter: MeterConfig,
    /// CSMS base URL; the station id is appended as the path segment
    pub csms_url: String,
    #[serde(default)]
    pub auth: CsmsAuth,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl StationConfig {
    /// Validate the configuration at the registry boundary.
    pub fn validate(&self) -> DomainResult<()> {
        if self.id.trim().is_empty() {
            return Err(DomainError::InvalidConfig("station id is empty".into()));
        }
        if self.csms_url.trim().is_empty() {
            return Err(DomainError::InvalidConfig("csms_url is empty".into()));
        }
        if !self.csms_url.starts_with("ws://") && !self.csms_url.starts_with("wss://") {
            return Err(DomainError::InvalidConfig(format!(
                "csms_url must be a ws:// or wss:// URL, got '{}'",
                self.csms_url
            )));
        }
        if self.connectors.is_empty() {
            return Err(DomainError::InvalidConfig(
                "station must have at least one connector".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.connectors {
            if c.id == 0 {
                return Err(DomainError::InvalidConfig(
                    "connector ids must be strictly positive".into(),
                ));
            }
            if !seen.insert(c.id) {
                return Err(DomainError::InvalidConfig(format!(
                    "duplicate connector id {}",
                    c.id
                )));
            }
            if c.max_power_w <= 0.0 {
                return Err(DomainError::InvalidConfig(format!(
                    "connector {} max power must be positive",
                    c.id
                )));
            }
        }
        if self.meter.sample_interval_secs == 0 {
            return Err(DomainError::InvalidConfig(
                "meter sample interval must be positive".into(),
            ));
        }
        if self.simulation.heartbeat_interval_secs == 0 {
            return Err(DomainError::InvalidConfig(
                "heartbeat interval must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.simulation.variance) {
            return Err(DomainError::InvalidConfig(
                "variance must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    /// Full WebSocket URL for this station (`<csms_url>/<station_id>`).
    pub fn websocket_url(&self) -> String {
        format!("{}/{}", self.csms_url.trim_end_matches('/'), self.id)
    }
}

/// One physical charging outlet on the station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector id, unique within the station, ≥ 1
    pub id: u32,
    #[serde(default)]
    pub connector_type: ConnectorType,
    /// Maximum deliverable power in watts
    pub max_power_w: f64,
}

/// Physical connector type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectorType {
    Type1,
    #[default]
    Type2,
    #[serde(rename = "CCS")]
    Ccs,
    #[serde(rename = "CHAdeMO")]
    Chademo,
    Schuko,
}

/// Meter-value emission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Seconds between MeterValues samples while charging
    pub sample_interval_secs: u64,
    /// Measurands reported in each sample
    pub measurands: Vec<String>,
    /// Clock-aligned reporting interval (0 disables aligned data)
    pub aligned_data_interval_secs: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 60,
            measurands: vec!["Energy.Active.Import.Register".to_string()],
            aligned_data_interval_secs: 0,
        }
    }
}

/// Credentials attached to the WebSocket handshake.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CsmsAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

/// Simulation behaviour knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Delay between connect and BootNotification, in milliseconds
    pub boot_delay_ms: u64,
    /// Heartbeat cadence when the CSMS does not dictate one
    pub heartbeat_interval_secs: u64,
    /// IdTag presented when none is supplied by the caller
    pub default_id_tag: String,
    /// Simulated energy delivery rate in watts while charging
    pub energy_delivery_rate_w: f64,
    /// Perturb meter samples by `variance`
    pub randomize: bool,
    /// Relative variance applied per sample (0.05 = ±5%)
    pub variance: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            boot_delay_ms: 1_000,
            heartbeat_interval_secs: 300,
            default_id_tag: "EMULATOR".to_string(),
            energy_delivery_rate_w: 11_000.0,
            randomize: false,
            variance: 0.05,
        }
    }
}

// ── Runtime state ──────────────────────────────────────────────

/// Station lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationLifecycle {
    Disconnected,
    Connecting,
    Connected,
    Booting,
    Operational,
    Faulted,
    Stopping,
}

impl StationLifecycle {
    /// Whether periodic emitters (heartbeat, meter values) may run.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Operational)
    }
}

/// Volatile per-station state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRuntime {
    pub lifecycle: StationLifecycle,
    pub connection_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_transaction_id: Option<i64>,
}

impl Default for StationRuntime {
    fn default() -> Self {
        Self {
            lifecycle: StationLifecycle::Disconnected,
            connection_status: "disconnected".to_string(),
            last_heartbeat: None,
            last_error: None,
            connected_at: None,
            current_transaction_id: None,
        }
    }
}

/// Connector status, mirroring the OCPP 1.6 status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Preparing,
    Charging,
    #[serde(rename = "SuspendedEVSE")]
    SuspendedEvse,
    #[serde(rename = "SuspendedEV")]
    SuspendedEv,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    /// OCPP wire representation of the status.
    pub fn as_ocpp(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEvse => "SuspendedEVSE",
            Self::SuspendedEv => "SuspendedEV",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }

    /// States in which the connector may hold a transaction.
    pub fn may_hold_transaction(&self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Charging | Self::SuspendedEv | Self::SuspendedEvse | Self::Finishing
        )
    }
}

/// Volatile per-connector state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRuntime {
    pub status: ConnectorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    /// Accumulated active energy in watt-hours
    pub meter_wh: f64,
    pub status_changed_at: DateTime<Utc>,
}

impl Default for ConnectorRuntime {
    fn default() -> Self {
        Self {
            status: ConnectorStatus::Available,
            transaction_id: None,
            meter_wh: 0.0,
            status_changed_at: Utc::now(),
        }
    }
}

/// Point-in-time copy of a station's full state, taken under the station
/// lock and consumed after release (sync loop, observers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub config: StationConfig,
    pub runtime: StationRuntime,
    /// Connector id → runtime, in connector-id order
    pub connectors: Vec<(u32, ConnectorRuntime)>,
    pub snapshot_at: DateTime<Utc>,
}

impl StationSnapshot {
    pub fn active_transaction_ids(&self) -> Vec<i64> {
        self.connectors
            .iter()
            .filter_map(|(_, c)| c.transaction_id)
            .collect()
    }
}

/// One connect→disconnect span, persisted to the sessions collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub station_id: String,
    pub protocol_version: OcppVersion,
    pub connected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StationConfig {
        StationConfig {
            id: "CP-1".into(),
            name: "Test station".into(),
            enabled: true,
            auto_start: false,
            protocol_version: OcppVersion::V16,
            vendor: "Voltsim".into(),
            model: "EMU-1".into(),
            serial_number: None,
            firmware_version: Some("1.0.0".into()),
            connectors: vec![ConnectorConfig {
                id: 1,
                connector_type: ConnectorType::Type2,
                max_power_w: 22_000.0,
            }],
            feature_profiles: vec!["Core".into()],
            meter: MeterConfig::default(),
            csms_url: "ws://localhost:9000/ocpp".into(),
            auth: CsmsAuth::None,
            simulation: SimulationConfig::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn zero_connector_id_rejected() {
        let mut cfg = config();
        cfg.connectors[0].id = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_connector_id_rejected() {
        let mut cfg = config();
        cfg.connectors.push(cfg.connectors[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_ws_url_rejected() {
        let mut cfg = config();
        cfg.csms_url = "http://localhost:9000".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn websocket_url_appends_station_id() {
        let cfg = config();
        assert_eq!(cfg.websocket_url(), "ws://localhost:9000/ocpp/CP-1");

        let mut trailing = config();
        trailing.csms_url = "ws://localhost:9000/ocpp/".into();
        assert_eq!(trailing.websocket_url(), "ws://localhost:9000/ocpp/CP-1");
    }

    #[test]
    fn transaction_holding_states() {
        assert!(ConnectorStatus::Charging.may_hold_transaction());
        assert!(ConnectorStatus::Finishing.may_hold_transaction());
        assert!(!ConnectorStatus::Available.may_hold_transaction());
        assert!(!ConnectorStatus::Faulted.may_hold_transaction());
    }
}
