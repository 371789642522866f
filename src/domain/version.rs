//! OCPP protocol version
//!
//! The subprotocol advertised during the WebSocket handshake is the single
//! source of truth for which dispatcher variant owns a station.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported OCPP protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    #[serde(rename = "1.6")]
    V16,
    /// OCPP 2.0.1
    #[serde(rename = "2.0.1")]
    V201,
    /// OCPP 2.1
    #[serde(rename = "2.1")]
    V21,
}

impl OcppVersion {
    /// WebSocket subprotocol identifier for this OCPP version.
    ///
    /// Advertised in the `Sec-WebSocket-Protocol` header during handshake.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::V16 => "ocpp1.6",
            Self::V201 => "ocpp2.0.1",
            Self::V21 => "ocpp2.1",
        }
    }

    /// Parse an OCPP version from a WebSocket subprotocol string.
    pub fn from_subprotocol(s: &str) -> Option<Self> {
        match s.trim() {
            "ocpp1.6" => Some(Self::V16),
            "ocpp2.0.1" => Some(Self::V201),
            "ocpp2.1" => Some(Self::V21),
            _ => None,
        }
    }

    /// Parse from the configuration tag ("1.6", "2.0.1", "2.1").
    pub fn from_tag(s: &str) -> Option<Self> {
        match s.trim() {
            "1.6" => Some(Self::V16),
            "2.0.1" => Some(Self::V201),
            "2.1" => Some(Self::V21),
            _ => None,
        }
    }

    /// Human-readable version string.
    pub fn version_string(&self) -> &'static str {
        match self {
            Self::V16 => "1.6",
            Self::V201 => "2.0.1",
            Self::V21 => "2.1",
        }
    }

    /// The version whose handlers back this one when an action is not
    /// overridden (2.1 falls back to 2.0.1).
    pub fn fallback(&self) -> Option<Self> {
        match self {
            Self::V21 => Some(Self::V201),
            _ => None,
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCPP {}", self.version_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprotocol_roundtrip() {
        for v in [OcppVersion::V16, OcppVersion::V201, OcppVersion::V21] {
            assert_eq!(OcppVersion::from_subprotocol(v.subprotocol()), Some(v));
        }
    }

    #[test]
    fn tag_roundtrip() {
        for v in [OcppVersion::V16, OcppVersion::V201, OcppVersion::V21] {
            assert_eq!(OcppVersion::from_tag(v.version_string()), Some(v));
        }
    }

    #[test]
    fn unknown_subprotocol_rejected() {
        assert_eq!(OcppVersion::from_subprotocol("ocpp1.5"), None);
    }

    #[test]
    fn v21_falls_back_to_v201() {
        assert_eq!(OcppVersion::V21.fallback(), Some(OcppVersion::V201));
        assert_eq!(OcppVersion::V201.fallback(), None);
        assert_eq!(OcppVersion::V16.fallback(), None);
    }
}
