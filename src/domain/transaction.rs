//! Charging transaction model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    Completed,
    Failed,
}

/// A single authorized charging session on one connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id. CSMS-minted for OCPP 1.6 when a CSMS acknowledged the
    /// StartTransaction; otherwise the station's local counter value.
    pub id: i64,
    pub station_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    pub started_at: DateTime<Utc>,
    pub meter_start_wh: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_stop_wh: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub status: TransactionStatus,
    /// True when the id was minted locally because no CSMS acknowledged the
    /// start (flagged at the boundary; the CSMS is authoritative in 1.6).
    #[serde(default)]
    pub locally_minted: bool,
}

impl Transaction {
    pub fn start(
        id: i64,
        station_id: impl Into<String>,
        connector_id: u32,
        id_tag: impl Into<String>,
        meter_start_wh: i64,
    ) -> Self {
        Self {
            id,
            station_id: station_id.into(),
            connector_id,
            id_tag: id_tag.into(),
            started_at: Utc::now(),
            meter_start_wh,
            stopped_at: None,
            meter_stop_wh: None,
            stop_reason: None,
            status: TransactionStatus::Active,
            locally_minted: false,
        }
    }

    /// Complete the transaction. Clamps the stop meter so a completed
    /// transaction always satisfies `meter_stop ≥ meter_start`.
    pub fn complete(&mut self, meter_stop_wh: i64, reason: Option<String>) {
        self.meter_stop_wh = Some(meter_stop_wh.max(self.meter_start_wh));
        self.stopped_at = Some(Utc::now());
        self.stop_reason = reason;
        self.status = TransactionStatus::Completed;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.stopped_at = Some(Utc::now());
        self.stop_reason = Some(reason.into());
        self.status = TransactionStatus::Failed;
    }

    /// Energy consumed in Wh, derived once both meter readings are present.
    pub fn energy_wh(&self) -> Option<i64> {
        self.meter_stop_wh.map(|stop| stop - self.meter_start_wh)
    }

    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }
}

/// One synthesized meter reading, persisted to the meter_values collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSample {
    pub station_id: String,
    pub connector_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    pub value_wh: f64,
    pub timestamp: DateTime<Utc>,
}
