//! OCPP 1.6 dispatcher — station-side handlers and outbound payloads
//!
//! Handlers answer the Core-profile commands a CSMS drives at a charge
//! point; the `outbound` module builds the Calls the station itself emits
//! and decodes their typed responses.

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::authorize::AuthorizeResponse;
use rust_ocpp::v1_6::messages::boot_notification::BootNotificationResponse;
use rust_ocpp::v1_6::messages::change_availability::ChangeAvailabilityRequest;
use rust_ocpp::v1_6::messages::change_configuration::ChangeConfigurationRequest;
use rust_ocpp::v1_6::messages::get_configuration::GetConfigurationRequest;
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatResponse;
use rust_ocpp::v1_6::messages::remote_start_transaction::RemoteStartTransactionRequest;
use rust_ocpp::v1_6::messages::remote_stop_transaction::RemoteStopTransactionRequest;
use rust_ocpp::v1_6::messages::reset::ResetRequest;
use rust_ocpp::v1_6::messages::start_transaction::StartTransactionResponse;
use rust_ocpp::v1_6::messages::stop_transaction::StopTransactionResponse;
use rust_ocpp::v1_6::messages::trigger_message::TriggerMessageRequest;
use rust_ocpp::v1_6::messages::unlock_connector::UnlockConnectorRequest;
use rust_ocpp::v1_6::types::{
    AuthorizationStatus, AvailabilityType, RegistrationStatus, ResetRequestStatus,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::info;

use crate::domain::OcppVersion;
use crate::ocpp::CallErrorCode;
use crate::station::{AvailabilityOutcome, ConfigChangeOutcome, UnlockOutcome};

use super::{handler, CommandError, Dispatcher, HandlerReject};

fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, HandlerReject> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        HandlerReject::new(CallErrorCode::FormationViolation, e.to_string())
    })
}

/// Build the OCPP 1.6 dispatch table.
pub fn dispatcher() -> Dispatcher {
    let mut d = Dispatcher::new(OcppVersion::V16, None);

    d.register(
        "RemoteStartTransaction",
        handler(|ctx| async move {
            let req: RemoteStartTransactionRequest = decode(&ctx.payload)?;
            info!(
                station_id = ctx.station.id(),
                id_tag = req.id_tag.as_str(),
                connector_id = ?req.connector_id,
                "RemoteStartTransaction"
            );
            let status = match ctx
                .station
                .remote_start(req.connector_id, Some(req.id_tag))
                .await
            {
                Ok(_) => "Accepted",
                Err(_) => "Rejected",
            };
            Ok(json!({ "status": status }))
        }),
    );

    d.register(
        "RemoteStopTransaction",
        handler(|ctx| async move {
            let req: RemoteStopTransactionRequest = decode(&ctx.payload)?;
            let status = match ctx.station.remote_stop(req.transaction_id as i64).await {
                Ok(_) => "Accepted",
                Err(_) => "Rejected",
            };
            Ok(json!({ "status": status }))
        }),
    );

    d.register(
        "Reset",
        handler(|ctx| async move {
            let req: ResetRequest = decode(&ctx.payload)?;
            let hard = matches!(req.kind, ResetRequestStatus::Hard);
            ctx.station.begin_reset(hard).await;
            Ok(json!({ "status": "Accepted" }))
        }),
    );

    d.register(
        "UnlockConnector",
        handler(|ctx| async move {
            let req: UnlockConnectorRequest = decode(&ctx.payload)?;
            let status = match ctx.station.unlock_connector(req.connector_id).await {
                UnlockOutcome::Unlocked => "Unlocked",
                UnlockOutcome::UnlockFailed => "UnlockFailed",
                UnlockOutcome::NotSupported => "NotSupported",
            };
            Ok(json!({ "status": status }))
        }),
    );

    d.register(
        "ChangeAvailability",
        handler(|ctx| async move {
            let req: ChangeAvailabilityRequest = decode(&ctx.payload)?;
            let operative = matches!(req.kind, AvailabilityType::Operative);
            let status = match ctx
                .station
                .change_availability(req.connector_id, operative)
                .await
            {
                AvailabilityOutcome::Accepted => "Accepted",
                AvailabilityOutcome::Scheduled => "Scheduled",
                AvailabilityOutcome::Rejected => "Rejected",
            };
            Ok(json!({ "status": status }))
        }),
    );

    d.register(
        "ChangeConfiguration",
        handler(|ctx| async move {
            let req: ChangeConfigurationRequest = decode(&ctx.payload)?;
            let status = match ctx.station.change_configuration(&req.key, &req.value).await {
                ConfigChangeOutcome::Accepted => "Accepted",
                ConfigChangeOutcome::Rejected => "Rejected",
                ConfigChangeOutcome::RebootRequired => "RebootRequired",
                ConfigChangeOutcome::NotSupported => "NotSupported",
            };
            Ok(json!({ "status": status }))
        }),
    );

    d.register(
        "GetConfiguration",
        handler(|ctx| async move {
            let req: GetConfigurationRequest = decode(&ctx.payload)?;
            let (known, unknown) = ctx.station.get_configuration(req.key).await;
            let configuration_key: Vec<Value> = known
                .into_iter()
                .map(|k| {
                    json!({
                        "key": k.key,
                        "readonly": k.readonly,
                        "value": k.value,
                    })
                })
                .collect();
            Ok(json!({
                "configurationKey": configuration_key,
                "unknownKey": unknown,
            }))
        }),
    );

    d.register(
        "ClearCache",
        handler(|ctx| async move {
            let status = if ctx.station.clear_auth_cache().await {
                "Accepted"
            } else {
                "Rejected"
            };
            Ok(json!({ "status": status }))
        }),
    );

    d.register(
        "DataTransfer",
        handler(|ctx| async move {
            let vendor_id = ctx.payload["vendorId"].as_str().unwrap_or_default().to_string();
            let message_id = ctx.payload["messageId"].as_str().map(str::to_string);
            let data = ctx.payload["data"].as_str().map(str::to_string);
            let (status, response_data) = ctx
                .station
                .data_transfer(&vendor_id, message_id.as_deref(), data.as_deref())
                .await;
            let mut response = json!({ "status": status });
            if let Some(data) = response_data {
                response["data"] = json!(data);
            }
            Ok(response)
        }),
    );

    d.register(
        "TriggerMessage",
        handler(|ctx| async move {
            let req: TriggerMessageRequest = decode(&ctx.payload)?;
            let trigger = format!("{:?}", req.requested_message);
            let accepted = ctx
                .station
                .trigger_message(&trigger, req.connector_id)
                .await;
            Ok(json!({ "status": if accepted { "Accepted" } else { "NotImplemented" } }))
        }),
    );

    d.register(
        "GetLocalListVersion",
        handler(|ctx| async move {
            Ok(json!({ "listVersion": ctx.station.local_list_version() }))
        }),
    );

    d.register(
        "SendLocalList",
        handler(|ctx| async move {
            let version = ctx.payload["listVersion"].as_i64().unwrap_or(0);
            let update_type = ctx.payload["updateType"].as_str().unwrap_or("Full");
            let accepted = ctx.station.apply_local_list(version as i32, update_type);
            Ok(json!({ "status": if accepted { "Accepted" } else { "Failed" } }))
        }),
    );

    d
}

// ── Outbound payloads (station → CSMS) ─────────────────────────

pub mod outbound {
    use super::*;
    use crate::domain::{ConnectorStatus, StationConfig};
    use crate::ocpp::wire_timestamp;

    pub fn boot_notification(config: &StationConfig) -> Value {
        let mut payload = json!({
            "chargePointVendor": config.vendor,
            "chargePointModel": config.model,
        });
        if let Some(ref serial) = config.serial_number {
            payload["chargePointSerialNumber"] = json!(serial);
        }
        if let Some(ref firmware) = config.firmware_version {
            payload["firmwareVersion"] = json!(firmware);
        }
        payload
    }

    pub fn heartbeat() -> Value {
        json!({})
    }

    pub fn status_notification(
        connector_id: u32,
        status: ConnectorStatus,
        error_code: &str,
    ) -> Value {
        json!({
            "connectorId": connector_id,
            "status": status.as_ocpp(),
            "errorCode": error_code,
            "timestamp": wire_timestamp(Utc::now()),
        })
    }

    pub fn authorize(id_tag: &str) -> Value {
        json!({ "idTag": id_tag })
    }

    pub fn start_transaction(connector_id: u32, id_tag: &str, meter_start_wh: i64) -> Value {
        json!({
            "connectorId": connector_id,
            "idTag": id_tag,
            "meterStart": meter_start_wh,
            "timestamp": wire_timestamp(Utc::now()),
        })
    }

    pub fn stop_transaction(
        transaction_id: i64,
        meter_stop_wh: i64,
        reason: Option<&str>,
    ) -> Value {
        let mut payload = json!({
            "transactionId": transaction_id,
            "meterStop": meter_stop_wh,
            "timestamp": wire_timestamp(Utc::now()),
        });
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        payload
    }

    pub fn meter_values(connector_id: u32, transaction_id: Option<i64>, value_wh: f64) -> Value {
        let mut payload = json!({
            "connectorId": connector_id,
            "meterValue": [{
                "timestamp": wire_timestamp(Utc::now()),
                "sampledValue": [{
                    "value": format!("{:.1}", value_wh),
                    "context": "Sample.Periodic",
                    "measurand": "Energy.Active.Import.Register",
                    "unit": "Wh",
                }],
            }],
        });
        if let Some(tx) = transaction_id {
            payload["transactionId"] = json!(tx);
        }
        payload
    }

    pub fn data_transfer(vendor_id: &str, message_id: Option<&str>, data: Option<&str>) -> Value {
        let mut payload = json!({ "vendorId": vendor_id });
        if let Some(message_id) = message_id {
            payload["messageId"] = json!(message_id);
        }
        if let Some(data) = data {
            payload["data"] = json!(data);
        }
        payload
    }
}

// ── Response decoding (CSMS → station) ─────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStatus {
    Accepted,
    Pending,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct BootAck {
    pub status: BootStatus,
    pub interval_secs: u64,
}

fn invalid<T>(e: impl std::fmt::Display) -> Result<T, CommandError> {
    Err(CommandError::InvalidResponse(e.to_string()))
}

pub fn parse_boot_ack(payload: Value) -> Result<BootAck, CommandError> {
    let response: BootNotificationResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => return invalid(e),
    };
    let status = match response.status {
        RegistrationStatus::Accepted => BootStatus::Accepted,
        RegistrationStatus::Pending => BootStatus::Pending,
        RegistrationStatus::Rejected => BootStatus::Rejected,
    };
    Ok(BootAck {
        status,
        interval_secs: response.interval.max(0) as u64,
    })
}

pub fn parse_authorize_ack(payload: Value) -> Result<bool, CommandError> {
    let response: AuthorizeResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => return invalid(e),
    };
    Ok(matches!(
        response.id_tag_info.status,
        AuthorizationStatus::Accepted
    ))
}

#[derive(Debug, Clone)]
pub struct StartAck {
    pub transaction_id: i64,
    pub accepted: bool,
}

pub fn parse_start_ack(payload: Value) -> Result<StartAck, CommandError> {
    let response: StartTransactionResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => return invalid(e),
    };
    Ok(StartAck {
        transaction_id: response.transaction_id as i64,
        accepted: matches!(
            response.id_tag_info.status,
            AuthorizationStatus::Accepted
        ),
    })
}

pub fn parse_stop_ack(payload: Value) -> Result<bool, CommandError> {
    let response: StopTransactionResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => return invalid(e),
    };
    Ok(response
        .id_tag_info
        .map(|info| matches!(info.status, AuthorizationStatus::Accepted))
        .unwrap_or(true))
}

pub fn parse_heartbeat_ack(payload: Value) -> Result<DateTime<Utc>, CommandError> {
    let response: HeartbeatResponse = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => return invalid(e),
    };
    Ok(response.current_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConnectorConfig, ConnectorStatus, ConnectorType, CsmsAuth, MeterConfig,
        SimulationConfig, StationConfig};

    fn config() -> StationConfig {
        StationConfig {
            id: "CP-1".into(),
            name: "T".into(),
            enabled: true,
            auto_start: false,
            protocol_version: OcppVersion::V16,
            vendor: "Voltsim".into(),
            model: "EMU-1".into(),
            serial_number: Some("SN-1".into()),
            firmware_version: Some("1.2.3".into()),
            connectors: vec![ConnectorConfig {
                id: 1,
                connector_type: ConnectorType::Type2,
                max_power_w: 22_000.0,
            }],
            feature_profiles: vec![],
            meter: MeterConfig::default(),
            csms_url: "ws://localhost:9000".into(),
            auth: CsmsAuth::None,
            simulation: SimulationConfig::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn boot_notification_carries_descriptors() {
        let payload = outbound::boot_notification(&config());
        assert_eq!(payload["chargePointVendor"], "Voltsim");
        assert_eq!(payload["chargePointModel"], "EMU-1");
        assert_eq!(payload["chargePointSerialNumber"], "SN-1");
        assert_eq!(payload["firmwareVersion"], "1.2.3");
    }

    #[test]
    fn status_notification_is_well_formed() {
        let payload = outbound::status_notification(1, ConnectorStatus::Available, "NoError");
        assert_eq!(payload["connectorId"], 1);
        assert_eq!(payload["status"], "Available");
        assert_eq!(payload["errorCode"], "NoError");
        assert!(payload["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn meter_values_nest_sampled_value() {
        let payload = outbound::meter_values(1, Some(42), 1234.5);
        assert_eq!(payload["connectorId"], 1);
        assert_eq!(payload["transactionId"], 42);
        let sample = &payload["meterValue"][0]["sampledValue"][0];
        assert_eq!(sample["value"], "1234.5");
        assert_eq!(sample["unit"], "Wh");
        assert_eq!(sample["measurand"], "Energy.Active.Import.Register");
    }

    #[test]
    fn parse_boot_ack_accepted() {
        let ack = parse_boot_ack(json!({
            "status": "Accepted",
            "currentTime": "2025-01-01T00:00:00Z",
            "interval": 30,
        }))
        .unwrap();
        assert_eq!(ack.status, BootStatus::Accepted);
        assert_eq!(ack.interval_secs, 30);
    }

    #[test]
    fn parse_boot_ack_rejects_malformed() {
        assert!(matches!(
            parse_boot_ack(json!({"interval": 30})),
            Err(CommandError::InvalidResponse(_))
        ));
    }

    #[test]
    fn parse_start_ack_adopts_csms_transaction_id() {
        let ack = parse_start_ack(json!({
            "transactionId": 42,
            "idTagInfo": {"status": "Accepted"},
        }))
        .unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.transaction_id, 42);
    }

    #[test]
    fn parse_authorize_ack_rejection() {
        let accepted = parse_authorize_ack(json!({
            "idTagInfo": {"status": "Blocked"},
        }))
        .unwrap();
        assert!(!accepted);
    }

    #[test]
    fn parse_stop_ack_defaults_to_accepted() {
        assert!(parse_stop_ack(json!({})).unwrap());
    }
}
