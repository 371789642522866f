//! OCPP-J wire protocol: framing, error codes, payload validation

pub mod error_code;
pub mod frame;
pub mod schema;

pub use error_code::CallErrorCode;
pub use frame::{new_unique_id, FrameError, OcppFrame};
pub use schema::{SchemaViolation, ValidationMode};

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp the way OCPP expects it on the wire: ISO 8601 with
/// second precision, UTC.
pub fn wire_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
