//! Wire-message log records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::version::OcppVersion;

/// Direction of a wire message, from the station's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

/// OCPP-J envelope kind, mirroring the wire discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Call,
    CallResult,
    CallError,
}

impl MessageType {
    pub fn discriminator(&self) -> u8 {
        match self {
            Self::Call => 2,
            Self::CallResult => 3,
            Self::CallError => 4,
        }
    }

    pub fn from_discriminator(d: u64) -> Option<Self> {
        match d {
            2 => Some(Self::Call),
            3 => Some(Self::CallResult),
            4 => Some(Self::CallError),
            _ => None,
        }
    }
}

/// Append-only record of one wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntry {
    pub id: String,
    pub station_id: String,
    pub direction: Direction,
    pub message_type: MessageType,
    /// Action name for a Call; for a CallResult, the action of the Call it
    /// answers (looked up via the pending-request table)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub unique_id: String,
    pub protocol_version: OcppVersion,
    pub payload: Value,
    pub raw: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl MessageEntry {
    pub fn new(
        station_id: impl Into<String>,
        direction: Direction,
        message_type: MessageType,
        unique_id: impl Into<String>,
        protocol_version: OcppVersion,
        payload: Value,
        raw: impl Into<String>,
    ) -> Self {
        let unique_id = unique_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            station_id: station_id.into(),
            direction,
            message_type,
            action: None,
            correlation_id: Some(unique_id.clone()),
            unique_id,
            protocol_version,
            payload,
            raw: raw.into(),
            timestamp: Utc::now(),
            error_code: None,
            error_description: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, description: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_description = Some(description.into());
        self
    }
}

/// Filter for message queries and subscriber fan-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn matches(&self, entry: &MessageEntry) -> bool {
        if let Some(ref id) = self.station_id {
            if &entry.station_id != id {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if entry.direction != direction {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if entry.action.as_deref() != Some(action.as_str()) {
                return false;
            }
        }
        if let Some(message_type) = self.message_type {
            if entry.message_type != message_type {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(station: &str, direction: Direction, action: &str) -> MessageEntry {
        MessageEntry::new(
            station,
            direction,
            MessageType::Call,
            "u1",
            OcppVersion::V16,
            serde_json::json!({}),
            "[2,\"u1\",\"X\",{}]",
        )
        .with_action(action)
    }

    #[test]
    fn filter_by_station_and_action() {
        let filter = MessageFilter {
            station_id: Some("CP-1".into()),
            action: Some("Heartbeat".into()),
            ..Default::default()
        };
        assert!(filter.matches(&entry("CP-1", Direction::Sent, "Heartbeat")));
        assert!(!filter.matches(&entry("CP-2", Direction::Sent, "Heartbeat")));
        assert!(!filter.matches(&entry("CP-1", Direction::Sent, "Authorize")));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = MessageFilter::default();
        assert!(filter.matches(&entry("CP-1", Direction::Received, "Reset")));
    }

    #[test]
    fn discriminator_roundtrip() {
        for t in [MessageType::Call, MessageType::CallResult, MessageType::CallError] {
            assert_eq!(
                MessageType::from_discriminator(t.discriminator() as u64),
                Some(t)
            );
        }
        assert_eq!(MessageType::from_discriminator(5), None);
    }
}
