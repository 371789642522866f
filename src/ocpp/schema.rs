//! Per-action payload validation
//!
//! Declarative schemas for the Call payloads the station accepts from the
//! CSMS: required fields, optional fields, primitive types, enumerations.
//! Strict mode rejects unknown fields; lenient mode records them as
//! warnings. Actions without a registered schema pass through untouched
//! (the dispatcher answers unknown actions with `NotImplemented` anyway).

use serde_json::Value;
use thiserror::Error;

use super::error_code::CallErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Unknown fields are violations
    Strict,
    /// Unknown fields are recorded as warnings
    Lenient,
}

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Str,
    Int,
    Bool,
    Object,
    Array,
    StrEnum(&'static [&'static str]),
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Str => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::StrEnum(variants) => value
                .as_str()
                .map(|s| variants.contains(&s))
                .unwrap_or(false),
        }
    }
}

pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

pub struct ActionSchema {
    pub action: &'static str,
    pub required: &'static [FieldSpec],
    pub optional: &'static [FieldSpec],
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaViolation {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{0}' has the wrong type")]
    TypeMismatch(&'static str),
    #[error("field '{0}' is not an allowed value")]
    EnumMismatch(&'static str),
    #[error("unknown field '{0}'")]
    UnknownField(String),
}

impl SchemaViolation {
    /// The CallError code to answer with for this violation.
    pub fn error_code(&self) -> CallErrorCode {
        match self {
            Self::NotAnObject => CallErrorCode::FormationViolation,
            Self::MissingField(_) => CallErrorCode::OccurrenceConstraintViolation,
            Self::TypeMismatch(_) => CallErrorCode::TypeConstraintViolation,
            Self::EnumMismatch(_) => CallErrorCode::PropertyConstraintViolation,
            Self::UnknownField(_) => CallErrorCode::OccurrenceConstraintViolation,
        }
    }
}

// ── OCPP 1.6 Core schemas (CSMS → station) ─────────────────────

const RESET_TYPES: &[&str] = &["Hard", "Soft"];
const AVAILABILITY_TYPES: &[&str] = &["Inoperative", "Operative"];
const MESSAGE_TRIGGERS: &[&str] = &[
    "BootNotification",
    "DiagnosticsStatusNotification",
    "FirmwareStatusNotification",
    "Heartbeat",
    "MeterValues",
    "StatusNotification",
];
const LIST_UPDATE_TYPES: &[&str] = &["Differential", "Full"];

static V16_SCHEMAS: &[ActionSchema] = &[
    ActionSchema {
        action: "RemoteStartTransaction",
        required: &[field("idTag", FieldKind::Str)],
        optional: &[
            field("connectorId", FieldKind::Int),
            field("chargingProfile", FieldKind::Object),
        ],
    },
    ActionSchema {
        action: "RemoteStopTransaction",
        required: &[field("transactionId", FieldKind::Int)],
        optional: &[],
    },
    ActionSchema {
        action: "Reset",
        required: &[field("type", FieldKind::StrEnum(RESET_TYPES))],
        optional: &[],
    },
    ActionSchema {
        action: "UnlockConnector",
        required: &[field("connectorId", FieldKind::Int)],
        optional: &[],
    },
    ActionSchema {
        action: "ChangeAvailability",
        required: &[
            field("connectorId", FieldKind::Int),
            field("type", FieldKind::StrEnum(AVAILABILITY_TYPES)),
        ],
        optional: &[],
    },
    ActionSchema {
        action: "ChangeConfiguration",
        required: &[field("key", FieldKind::Str), field("value", FieldKind::Str)],
        optional: &[],
    },
    ActionSchema {
        action: "GetConfiguration",
        required: &[],
        optional: &[field("key", FieldKind::Array)],
    },
    ActionSchema {
        action: "ClearCache",
        required: &[],
        optional: &[],
    },
    ActionSchema {
        action: "DataTransfer",
        required: &[field("vendorId", FieldKind::Str)],
        optional: &[
            field("messageId", FieldKind::Str),
            field("data", FieldKind::Str),
        ],
    },
    ActionSchema {
        action: "TriggerMessage",
        required: &[field("requestedMessage", FieldKind::StrEnum(MESSAGE_TRIGGERS))],
        optional: &[field("connectorId", FieldKind::Int)],
    },
    ActionSchema {
        action: "GetLocalListVersion",
        required: &[],
        optional: &[],
    },
    ActionSchema {
        action: "SendLocalList",
        required: &[
            field("listVersion", FieldKind::Int),
            field("updateType", FieldKind::StrEnum(LIST_UPDATE_TYPES)),
        ],
        optional: &[field("localAuthorizationList", FieldKind::Array)],
    },
];

fn schema_for(action: &str) -> Option<&'static ActionSchema> {
    V16_SCHEMAS.iter().find(|s| s.action == action)
}

/// Validate a Call payload against the schema registered for `action`.
///
/// Returns the list of lenient-mode warnings on success.
pub fn validate_action(
    action: &str,
    payload: &Value,
    mode: ValidationMode,
) -> Result<Vec<String>, SchemaViolation> {
    let Some(schema) = schema_for(action) else {
        return Ok(Vec::new());
    };

    let obj = match payload {
        Value::Object(map) => map,
        Value::Null if schema.required.is_empty() => return Ok(Vec::new()),
        _ => return Err(SchemaViolation::NotAnObject),
    };

    for spec in schema.required {
        match obj.get(spec.name) {
            None => return Err(SchemaViolation::MissingField(spec.name)),
            Some(v) if !spec.kind.accepts(v) => {
                return Err(match spec.kind {
                    FieldKind::StrEnum(_) if v.is_string() => {
                        SchemaViolation::EnumMismatch(spec.name)
                    }
                    _ => SchemaViolation::TypeMismatch(spec.name),
                })
            }
            Some(_) => {}
        }
    }

    for spec in schema.optional {
        if let Some(v) = obj.get(spec.name) {
            if !v.is_null() && !spec.kind.accepts(v) {
                return Err(match spec.kind {
                    FieldKind::StrEnum(_) if v.is_string() => {
                        SchemaViolation::EnumMismatch(spec.name)
                    }
                    _ => SchemaViolation::TypeMismatch(spec.name),
                });
            }
        }
    }

    let mut warnings = Vec::new();
    for key in obj.keys() {
        let known = schema.required.iter().chain(schema.optional).any(|f| f.name == key);
        if !known {
            match mode {
                ValidationMode::Strict => {
                    return Err(SchemaViolation::UnknownField(key.clone()))
                }
                ValidationMode::Lenient => {
                    warnings.push(format!("unknown field '{}' in {}", key, action))
                }
            }
        }
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_start_requires_id_tag() {
        let err = validate_action(
            "RemoteStartTransaction",
            &json!({"connectorId": 1}),
            ValidationMode::Strict,
        )
        .unwrap_err();
        assert_eq!(err, SchemaViolation::MissingField("idTag"));
        assert_eq!(err.error_code(), CallErrorCode::OccurrenceConstraintViolation);
    }

    #[test]
    fn wrong_type_rejected() {
        let err = validate_action(
            "RemoteStopTransaction",
            &json!({"transactionId": "42"}),
            ValidationMode::Strict,
        )
        .unwrap_err();
        assert_eq!(err, SchemaViolation::TypeMismatch("transactionId"));
        assert_eq!(err.error_code(), CallErrorCode::TypeConstraintViolation);
    }

    #[test]
    fn enum_value_enforced() {
        let err = validate_action(
            "Reset",
            &json!({"type": "Medium"}),
            ValidationMode::Strict,
        )
        .unwrap_err();
        assert_eq!(err, SchemaViolation::EnumMismatch("type"));
        assert_eq!(err.error_code(), CallErrorCode::PropertyConstraintViolation);
    }

    #[test]
    fn strict_rejects_unknown_fields() {
        let err = validate_action(
            "Reset",
            &json!({"type": "Soft", "extra": true}),
            ValidationMode::Strict,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaViolation::UnknownField(_)));
    }

    #[test]
    fn lenient_warns_on_unknown_fields() {
        let warnings = validate_action(
            "Reset",
            &json!({"type": "Soft", "extra": true}),
            ValidationMode::Lenient,
        )
        .unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("extra"));
    }

    #[test]
    fn valid_payload_passes_strict() {
        let warnings = validate_action(
            "RemoteStartTransaction",
            &json!({"idTag": "T1", "connectorId": 1}),
            ValidationMode::Strict,
        )
        .unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn unknown_action_passes_through() {
        assert!(validate_action("NoSuchAction", &json!({}), ValidationMode::Strict).is_ok());
    }
}
