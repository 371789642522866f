//! OCPP 2.0.1 dispatcher — station-side handlers and outbound payloads
//!
//! 2.0.1 is the superset table: the 2.1 dispatcher falls back here for any
//! action it does not override. TransactionEvent replaces the 1.6
//! Start/StopTransaction pair; provisioning travels through
//! GetVariables/SetVariables against the station's configuration keys.

use serde_json::{json, Value};
use tracing::info;

use crate::domain::{ConnectorStatus, OcppVersion};
use crate::station::{AvailabilityOutcome, ConfigChangeOutcome, UnlockOutcome};

use super::v16::{BootAck, BootStatus};
use super::{handler, CommandError, Dispatcher};

/// Build the OCPP 2.0.1 dispatch table.
pub fn dispatcher() -> Dispatcher {
    let mut d = Dispatcher::new(OcppVersion::V201, None);

    d.register(
        "RequestStartTransaction",
        handler(|ctx| async move {
            let id_token = ctx.payload["idToken"]["idToken"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let evse_id = ctx.payload["evseId"].as_u64().map(|id| id as u32);
            info!(
                station_id = ctx.station.id(),
                id_token = id_token.as_str(),
                evse_id = ?evse_id,
                "RequestStartTransaction"
            );
            let status = match ctx.station.remote_start(evse_id, Some(id_token)).await {
                Ok(_) => "Accepted",
                Err(_) => "Rejected",
            };
            Ok(json!({ "status": status }))
        }),
    );

    d.register(
        "RequestStopTransaction",
        handler(|ctx| async move {
            let transaction_id = ctx.payload["transactionId"]
                .as_str()
                .and_then(|s| s.parse::<i64>().ok());
            let status = match transaction_id {
                Some(id) => match ctx.station.remote_stop(id).await {
                    Ok(_) => "Accepted",
                    Err(_) => "Rejected",
                },
                None => "Rejected",
            };
            Ok(json!({ "status": status }))
        }),
    );

    d.register(
        "Reset",
        handler(|ctx| async move {
            let hard = ctx.payload["type"].as_str() == Some("Immediate");
            ctx.station.begin_reset(hard).await;
            Ok(json!({ "status": "Accepted" }))
        }),
    );

    d.register(
        "UnlockConnector",
        handler(|ctx| async move {
            let connector_id = ctx.payload["connectorId"].as_u64().unwrap_or(0) as u32;
            let status = match ctx.station.unlock_connector(connector_id).await {
                UnlockOutcome::Unlocked => "Unlocked",
                UnlockOutcome::UnlockFailed => "UnlockFailed",
                UnlockOutcome::NotSupported => "UnknownConnector",
            };
            Ok(json!({ "status": status }))
        }),
    );

    d.register(
        "ChangeAvailability",
        handler(|ctx| async move {
            let operative = ctx.payload["operationalStatus"].as_str() == Some("Operative");
            // Absent EVSE addresses the whole station: connector 0 fans out.
            let connector_id = ctx.payload["evse"]["connectorId"]
                .as_u64()
                .or_else(|| ctx.payload["evse"]["id"].as_u64())
                .unwrap_or(0) as u32;
            let status = match ctx
                .station
                .change_availability(connector_id, operative)
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
        "GetVariables",
        handler(|ctx| async move {
            let empty = Vec::new();
            let requests = ctx.payload["getVariableData"].as_array().unwrap_or(&empty);
            let mut results = Vec::with_capacity(requests.len());
            for item in requests {
                let variable = item["variable"]["name"].as_str().unwrap_or_default();
                let (known, _) = ctx
                    .station
                    .get_configuration(Some(vec![variable.to_string()]))
                    .await;
                let mut result = json!({
                    "component": item["component"],
                    "variable": item["variable"],
                });
                match known.first() {
                    Some(key) => {
                        result["attributeStatus"] = json!("Accepted");
                        result["attributeValue"] = json!(key.value);
                    }
                    None => {
                        result["attributeStatus"] = json!("UnknownVariable");
                    }
                }
                results.push(result);
            }
            Ok(json!({ "getVariableResult": results }))
        }),
    );

    d.register(
        "SetVariables",
        handler(|ctx| async move {
            let empty = Vec::new();
            let requests = ctx.payload["setVariableData"].as_array().unwrap_or(&empty);
            let mut results = Vec::with_capacity(requests.len());
            for item in requests {
                let variable = item["variable"]["name"].as_str().unwrap_or_default();
                let value = item["attributeValue"].as_str().unwrap_or_default();
                let status = match ctx.station.change_configuration(variable, value).await {
                    ConfigChangeOutcome::Accepted => "Accepted",
                    ConfigChangeOutcome::RebootRequired => "RebootRequired",
                    ConfigChangeOutcome::Rejected => "Rejected",
                    ConfigChangeOutcome::NotSupported => "UnknownVariable",
                };
                results.push(json!({
                    "component": item["component"],
                    "variable": item["variable"],
                    "attributeStatus": status,
                }));
            }
            Ok(json!({ "setVariableResult": results }))
        }),
    );

    d.register(
        "GetBaseReport",
        handler(|ctx| async move {
            let request_id = ctx.payload["requestId"].as_i64().unwrap_or(0);
            ctx.station.send_base_report(request_id).await;
            Ok(json!({ "status": "Accepted" }))
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
            let trigger = ctx.payload["requestedMessage"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let connector_id = ctx.payload["evse"]["connectorId"].as_u64().map(|id| id as u32);
            let accepted = ctx.station.trigger_message(&trigger, connector_id).await;
            Ok(json!({ "status": if accepted { "Accepted" } else { "NotImplemented" } }))
        }),
    );

    d.register(
        "GetLocalListVersion",
        handler(|ctx| async move {
            Ok(json!({ "versionNumber": ctx.station.local_list_version() }))
        }),
    );

    d.register(
        "SendLocalList",
        handler(|ctx| async move {
            let version = ctx.payload["versionNumber"].as_i64().unwrap_or(0);
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
    use crate::domain::StationConfig;
    use crate::ocpp::wire_timestamp;
    use chrono::Utc;

    pub fn boot_notification(config: &StationConfig) -> Value {
        let mut charging_station = json!({
            "model": config.model,
            "vendorName": config.vendor,
        });
        if let Some(ref serial) = config.serial_number {
            charging_station["serialNumber"] = json!(serial);
        }
        if let Some(ref firmware) = config.firmware_version {
            charging_station["firmwareVersion"] = json!(firmware);
        }
        json!({
            "chargingStation": charging_station,
            "reason": "PowerUp",
        })
    }

    pub fn heartbeat() -> Value {
        json!({})
    }

    /// 2.0.1 collapses the 1.6 occupancy states into `Occupied`.
    pub fn connector_status_value(status: ConnectorStatus) -> &'static str {
        match status {
            ConnectorStatus::Available => "Available",
            ConnectorStatus::Reserved => "Reserved",
            ConnectorStatus::Unavailable => "Unavailable",
            ConnectorStatus::Faulted => "Faulted",
            _ => "Occupied",
        }
    }

    pub fn status_notification(connector_id: u32, status: ConnectorStatus) -> Value {
        json!({
            "timestamp": wire_timestamp(Utc::now()),
            "connectorStatus": connector_status_value(status),
            "evseId": connector_id,
            "connectorId": connector_id,
        })
    }

    pub fn authorize(id_token: &str) -> Value {
        json!({
            "idToken": { "idToken": id_token, "type": "ISO14443" },
        })
    }

    pub struct TransactionEvent<'a> {
        pub event_type: &'a str,
        pub trigger_reason: &'a str,
        pub seq_no: u64,
        pub transaction_id: i64,
        pub charging_state: Option<&'a str>,
        pub evse_id: u32,
        pub id_token: Option<&'a str>,
        pub meter_wh: Option<f64>,
        pub stopped_reason: Option<&'a str>,
    }

    pub fn transaction_event(event: &TransactionEvent<'_>) -> Value {
        let mut transaction_info = json!({
            "transactionId": event.transaction_id.to_string(),
        });
        if let Some(state) = event.charging_state {
            transaction_info["chargingState"] = json!(state);
        }
        if let Some(reason) = event.stopped_reason {
            transaction_info["stoppedReason"] = json!(reason);
        }

        let mut payload = json!({
            "eventType": event.event_type,
            "timestamp": wire_timestamp(Utc::now()),
            "triggerReason": event.trigger_reason,
            "seqNo": event.seq_no,
            "transactionInfo": transaction_info,
            "evse": { "id": event.evse_id, "connectorId": event.evse_id },
        });
        if let Some(token) = event.id_token {
            payload["idToken"] = json!({ "idToken": token, "type": "ISO14443" });
        }
        if let Some(wh) = event.meter_wh {
            // v2.0.1 sampled values are numbers, not strings
            payload["meterValue"] = json!([{
                "timestamp": wire_timestamp(Utc::now()),
                "sampledValue": [{
                    "value": wh,
                    "measurand": "Energy.Active.Import.Register",
                    "unitOfMeasure": { "unit": "Wh" },
                }],
            }]);
        }
        payload
    }

    pub fn security_event_notification(event_type: &str) -> Value {
        json!({
            "type": event_type,
            "timestamp": wire_timestamp(Utc::now()),
        })
    }

    pub fn notify_report(request_id: i64, seq_no: u64, entries: Vec<Value>) -> Value {
        json!({
            "requestId": request_id,
            "generatedAt": wire_timestamp(Utc::now()),
            "seqNo": seq_no,
            "tbc": false,
            "reportData": entries,
        })
    }
}

// ── Response decoding (CSMS → station) ─────────────────────────

pub fn parse_boot_ack(payload: Value) -> Result<BootAck, CommandError> {
    let status = match payload["status"].as_str() {
        Some("Accepted") => BootStatus::Accepted,
        Some("Pending") => BootStatus::Pending,
        Some("Rejected") => BootStatus::Rejected,
        other => {
            return Err(CommandError::InvalidResponse(format!(
                "unexpected boot status {:?}",
                other
            )))
        }
    };
    Ok(BootAck {
        status,
        interval_secs: payload["interval"].as_u64().unwrap_or(0),
    })
}

pub fn parse_authorize_ack(payload: Value) -> Result<bool, CommandError> {
    match payload["idTokenInfo"]["status"].as_str() {
        Some(status) => Ok(status == "Accepted"),
        None => Err(CommandError::InvalidResponse(
            "missing idTokenInfo.status".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::outbound::*;
    use super::*;

    #[test]
    fn status_collapses_to_occupied() {
        assert_eq!(connector_status_value(ConnectorStatus::Charging), "Occupied");
        assert_eq!(connector_status_value(ConnectorStatus::Preparing), "Occupied");
        assert_eq!(connector_status_value(ConnectorStatus::Available), "Available");
        assert_eq!(connector_status_value(ConnectorStatus::Faulted), "Faulted");
    }

    #[test]
    fn transaction_event_started_shape() {
        let payload = transaction_event(&TransactionEvent {
            event_type: "Started",
            trigger_reason: "RemoteStart",
            seq_no: 0,
            transaction_id: 7,
            charging_state: Some("Charging"),
            evse_id: 1,
            id_token: Some("T1"),
            meter_wh: None,
            stopped_reason: None,
        });
        assert_eq!(payload["eventType"], "Started");
        assert_eq!(payload["transactionInfo"]["transactionId"], "7");
        assert_eq!(payload["idToken"]["idToken"], "T1");
        assert!(payload.get("meterValue").is_none());
    }

    #[test]
    fn transaction_event_meter_values_are_numeric() {
        let payload = transaction_event(&TransactionEvent {
            event_type: "Updated",
            trigger_reason: "MeterValuePeriodic",
            seq_no: 3,
            transaction_id: 7,
            charging_state: Some("Charging"),
            evse_id: 1,
            id_token: None,
            meter_wh: Some(120.5),
            stopped_reason: None,
        });
        let value = &payload["meterValue"][0]["sampledValue"][0]["value"];
        assert!(value.is_f64());
    }

    #[test]
    fn boot_ack_parses_status() {
        let ack = parse_boot_ack(serde_json::json!({
            "status": "Pending",
            "interval": 60,
            "currentTime": "2025-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(ack.status, BootStatus::Pending);
        assert_eq!(ack.interval_secs, 60);
    }

    #[test]
    fn boot_ack_rejects_unknown_status() {
        assert!(parse_boot_ack(serde_json::json!({"status": "Maybe"})).is_err());
    }
}
