//! Protocol dispatcher
//!
//! ## Architecture
//!
//! ```text
//! WsClient read pump ──► MessageRouter::handle_inbound
//!                              │
//!                   Call ──────┼────── CallResult / CallError
//!                      │       │              │
//!              Dispatcher (per version,       │
//!              2.1 falls back to 2.0.1)  PendingRequestTable
//!                      │                      │
//!              ActionHandler            resolves the waiter
//!                      │                registered by send_request
//!              CallResult/CallError ──► send queue
//! ```
//!
//! Handlers run on the read pump and must stay prompt: any station-initiated
//! request/response conversation (Authorize, StartTransaction, …) is spawned,
//! never awaited inline — the matching CallResult arrives on the same read
//! pump the handler is blocking.

pub mod pending;
pub mod v16;
pub mod v201;
pub mod v21;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{Direction, MessageEntry, MessageType, OcppVersion};
use crate::messagelog::SharedMessageLog;
use crate::ocpp::{new_unique_id, schema, CallErrorCode, OcppFrame, ValidationMode};
use crate::station::Station;
use crate::transport::{ClientError, SharedConnectionPool};

pub use pending::PendingRequestTable;

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("Station not connected")]
    NotConnected,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Response timeout")]
    Timeout,
    #[error("Station disconnected")]
    Disconnected,
    #[error("CallError {code}: {description}")]
    CallError {
        code: CallErrorCode,
        description: String,
    },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

// ── Handler plumbing ───────────────────────────────────────────

/// Rejection returned by a handler; marshalled into a CallError.
#[derive(Debug, Clone)]
pub struct HandlerReject {
    pub code: CallErrorCode,
    pub description: String,
}

impl HandlerReject {
    pub fn new(code: CallErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Context handed to every action handler.
pub struct HandlerContext {
    pub station: Arc<Station>,
    pub router: SharedMessageRouter,
    pub unique_id: String,
    pub payload: Value,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerReject>> + Send>>;
pub type ActionHandler = Arc<dyn Fn(HandlerContext) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into an [`ActionHandler`].
pub fn handler<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerReject>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Per-version dispatch table with an explicit parent fallback (2.1
/// consults 2.0.1 for any action it does not override).
pub struct Dispatcher {
    version: OcppVersion,
    handlers: HashMap<&'static str, ActionHandler>,
    parent: Option<Arc<Dispatcher>>,
}

impl Dispatcher {
    pub fn new(version: OcppVersion, parent: Option<Arc<Dispatcher>>) -> Self {
        Self {
            version,
            handlers: HashMap::new(),
            parent,
        }
    }

    pub fn version(&self) -> OcppVersion {
        self.version
    }

    pub fn register(&mut self, action: &'static str, handler: ActionHandler) {
        self.handlers.insert(action, handler);
    }

    /// Resolve a handler, consulting the parent chain on a miss.
    pub fn resolve(&self, action: &str) -> Option<ActionHandler> {
        self.handlers.get(action).cloned().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|parent| parent.resolve(action))
        })
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

// ── Router ─────────────────────────────────────────────────────

/// Version-aware message router shared by every station.
pub struct MessageRouter {
    dispatchers: HashMap<OcppVersion, Arc<Dispatcher>>,
    pending: PendingRequestTable,
    pool: SharedConnectionPool,
    log: SharedMessageLog,
    request_timeout: Duration,
    validation_mode: ValidationMode,
}

pub type SharedMessageRouter = Arc<MessageRouter>;

/// Build the router with the full dispatcher set (1.6, 2.0.1, 2.1).
pub fn build_router(
    pool: SharedConnectionPool,
    log: SharedMessageLog,
    request_timeout: Duration,
    validation_mode: ValidationMode,
) -> SharedMessageRouter {
    let v16 = Arc::new(v16::dispatcher());
    let v201 = Arc::new(v201::dispatcher());
    let v21 = Arc::new(v21::dispatcher(v201.clone()));

    let mut dispatchers = HashMap::new();
    dispatchers.insert(OcppVersion::V16, v16);
    dispatchers.insert(OcppVersion::V201, v201);
    dispatchers.insert(OcppVersion::V21, v21);

    Arc::new(MessageRouter {
        dispatchers,
        pending: PendingRequestTable::new(),
        pool,
        log,
        request_timeout,
        validation_mode,
    })
}

impl MessageRouter {
    pub fn pending(&self) -> &PendingRequestTable {
        &self.pending
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Resolve all pending requests of a station with `Disconnected`
    /// (invoked by the station driver on connection loss).
    pub fn fail_pending(&self, station_id: &str) -> usize {
        self.pending.fail_station(station_id)
    }

    // ── Inbound path ───────────────────────────────────────

    /// Handle one raw frame read from a station's socket.
    pub async fn handle_inbound(self: &Arc<Self>, station: Arc<Station>, raw: &str) {
        let station_id = station.id().to_string();
        let version = station.protocol_version();

        let frame = match OcppFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    station_id = station_id.as_str(),
                    error = %e,
                    raw,
                    "Dropping malformed frame"
                );
                metrics::counter!("ocpp_malformed_frames_total").increment(1);
                return;
            }
        };

        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                self.log.log_message(
                    MessageEntry::new(
                        &station_id,
                        Direction::Received,
                        MessageType::Call,
                        &unique_id,
                        version,
                        payload.clone(),
                        raw,
                    )
                    .with_action(&action),
                );
                self.handle_call(station, &station_id, version, unique_id, action, payload)
                    .await;
            }
            OcppFrame::CallResult { unique_id, payload } => {
                let action =
                    self.pending
                        .resolve_result(&station_id, &unique_id, payload.clone());
                if action.is_none() {
                    warn!(
                        station_id = station_id.as_str(),
                        unique_id = unique_id.as_str(),
                        "Orphan CallResult dropped"
                    );
                }
                let mut entry = MessageEntry::new(
                    &station_id,
                    Direction::Received,
                    MessageType::CallResult,
                    &unique_id,
                    version,
                    payload,
                    raw,
                );
                if let Some(action) = action {
                    entry = entry.with_action(action);
                }
                self.log.log_message(entry);
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                error_details: _,
            } => {
                let action = self.pending.resolve_error(
                    &station_id,
                    &unique_id,
                    CommandError::CallError {
                        code: error_code,
                        description: error_description.clone(),
                    },
                );
                if action.is_none() {
                    warn!(
                        station_id = station_id.as_str(),
                        unique_id = unique_id.as_str(),
                        "Orphan CallError dropped"
                    );
                }
                let mut entry = MessageEntry::new(
                    &station_id,
                    Direction::Received,
                    MessageType::CallError,
                    &unique_id,
                    version,
                    Value::Null,
                    raw,
                )
                .with_error(error_code.as_str(), &error_description);
                if let Some(action) = action {
                    entry = entry.with_action(action);
                }
                self.log.log_message(entry);
            }
        }
    }

    async fn handle_call(
        self: &Arc<Self>,
        station: Arc<Station>,
        station_id: &str,
        version: OcppVersion,
        unique_id: String,
        action: String,
        payload: Value,
    ) {
        // Schema validation first: protocol errors answer with a CallError,
        // they never disconnect.
        match schema::validate_action(&action, &payload, self.validation_mode) {
            Ok(warnings) => {
                for warning in warnings {
                    warn!(station_id, action = action.as_str(), warning = warning.as_str(), "Schema warning");
                }
            }
            Err(violation) => {
                warn!(
                    station_id,
                    action = action.as_str(),
                    violation = %violation,
                    "Rejecting Call with schema violation"
                );
                self.send_error_response(
                    station_id,
                    version,
                    &action,
                    &unique_id,
                    violation.error_code(),
                    violation.to_string(),
                );
                return;
            }
        }

        let Some(dispatcher) = self.dispatchers.get(&version) else {
            self.send_error_response(
                station_id,
                version,
                &action,
                &unique_id,
                CallErrorCode::NotSupported,
                format!("no dispatcher for {}", version),
            );
            return;
        };

        let Some(action_handler) = dispatcher.resolve(&action) else {
            debug!(station_id, action = action.as_str(), "Unknown action");
            self.send_error_response(
                station_id,
                version,
                &action,
                &unique_id,
                CallErrorCode::NotImplemented,
                format!("action '{}' is not implemented", action),
            );
            return;
        };

        let ctx = HandlerContext {
            station,
            router: self.clone(),
            unique_id: unique_id.clone(),
            payload,
        };
        let started = std::time::Instant::now();
        let outcome = action_handler(ctx).await;
        metrics::histogram!("ocpp_handler_latency_seconds", "action" => action.clone())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(response) => {
                let frame = OcppFrame::result(&unique_id, response.clone());
                let raw = frame.serialize();
                self.log.log_message(
                    MessageEntry::new(
                        station_id,
                        Direction::Sent,
                        MessageType::CallResult,
                        &unique_id,
                        version,
                        response,
                        &raw,
                    )
                    .with_action(&action),
                );
                if let Err(e) = self.pool.send(station_id, raw) {
                    warn!(station_id, action = action.as_str(), error = %e, "Failed to send CallResult");
                }
            }
            Err(reject) => {
                self.send_error_response(
                    station_id,
                    version,
                    &action,
                    &unique_id,
                    reject.code,
                    reject.description,
                );
            }
        }
    }

    fn send_error_response(
        &self,
        station_id: &str,
        version: OcppVersion,
        action: &str,
        unique_id: &str,
        code: CallErrorCode,
        description: String,
    ) {
        let frame = OcppFrame::error(unique_id, code, &description);
        let raw = frame.serialize();
        self.log.log_message(
            MessageEntry::new(
                station_id,
                Direction::Sent,
                MessageType::CallError,
                unique_id,
                version,
                Value::Null,
                &raw,
            )
            .with_action(action)
            .with_error(code.as_str(), &description),
        );
        if let Err(e) = self.pool.send(station_id, raw) {
            warn!(station_id, action, error = %e, "Failed to send CallError");
        }
    }

    // ── Outbound path ──────────────────────────────────────

    /// Send a station-initiated Call and await its response.
    ///
    /// Resolves with the CallResult payload, a `CallError`, `Timeout` after
    /// the configured request timeout, or `Disconnected` when the station's
    /// connection drops while the request is in flight.
    pub async fn send_request(
        &self,
        station_id: &str,
        version: OcppVersion,
        action: &str,
        payload: Value,
    ) -> Result<Value, CommandError> {
        let unique_id = new_unique_id();
        let frame = OcppFrame::Call {
            unique_id: unique_id.clone(),
            action: action.to_string(),
            payload: payload.clone(),
        };
        let raw = frame.serialize();

        let rx = self.pending.register(station_id, &unique_id, action);
        self.log.log_message(
            MessageEntry::new(
                station_id,
                Direction::Sent,
                MessageType::Call,
                &unique_id,
                version,
                payload,
                &raw,
            )
            .with_action(action),
        );

        debug!(station_id, action, unique_id = unique_id.as_str(), "Sending request");
        if let Err(e) = self.pool.send(station_id, raw) {
            self.pending.remove(station_id, &unique_id);
            return Err(match e {
                ClientError::NotConnected => CommandError::NotConnected,
                other => CommandError::SendFailed(other.to_string()),
            });
        }

        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sink dropped without resolution: the table entry was removed
            // out from under us (disconnect races resolve here).
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                self.pending.remove(station_id, &unique_id);
                warn!(station_id, action, unique_id = unique_id.as_str(), "Request timed out");
                Err(CommandError::Timeout)
            }
        };
        metrics::histogram!("ocpp_command_latency_seconds", "action" => action.to_string())
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Send raw bytes, bypassing the encoder (scenario `send_message`).
    /// The frame is still logged; classification is best-effort.
    pub fn send_raw(
        &self,
        station_id: &str,
        version: OcppVersion,
        raw: String,
    ) -> Result<(), CommandError> {
        let entry = match OcppFrame::parse(&raw) {
            Ok(OcppFrame::Call {
                unique_id, action, payload,
            }) => MessageEntry::new(
                station_id,
                Direction::Sent,
                MessageType::Call,
                unique_id,
                version,
                payload,
                &raw,
            )
            .with_action(action),
            Ok(OcppFrame::CallResult { unique_id, payload }) => MessageEntry::new(
                station_id,
                Direction::Sent,
                MessageType::CallResult,
                unique_id,
                version,
                payload,
                &raw,
            ),
            Ok(OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            }) => MessageEntry::new(
                station_id,
                Direction::Sent,
                MessageType::CallError,
                unique_id,
                version,
                Value::Null,
                &raw,
            )
            .with_error(error_code.as_str(), error_description),
            Err(_) => MessageEntry::new(
                station_id,
                Direction::Sent,
                MessageType::Call,
                new_unique_id(),
                version,
                Value::Null,
                &raw,
            ),
        };
        self.log.log_message(entry);

        self.pool.send(station_id, raw).map_err(|e| match e {
            ClientError::NotConnected => CommandError::NotConnected,
            other => CommandError::SendFailed(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v21_dispatcher_falls_back_to_v201() {
        let v201 = Arc::new(v201::dispatcher());
        let v21 = v21::dispatcher(v201.clone());

        // Overridden in 2.1
        assert!(v21.handlers.contains_key("SetDisplayMessage"));
        // Inherited from 2.0.1 via the parent pointer
        assert!(!v21.handlers.contains_key("RequestStartTransaction"));
        assert!(v21.resolve("RequestStartTransaction").is_some());
        // Unknown everywhere
        assert!(v21.resolve("NoSuchAction").is_none());
    }

    #[test]
    fn v16_dispatcher_covers_core_profile() {
        let d = v16::dispatcher();
        for action in [
            "RemoteStartTransaction",
            "RemoteStopTransaction",
            "Reset",
            "UnlockConnector",
            "ChangeAvailability",
            "ChangeConfiguration",
            "GetConfiguration",
            "ClearCache",
            "DataTransfer",
            "TriggerMessage",
            "GetLocalListVersion",
            "SendLocalList",
        ] {
            assert!(d.resolve(action).is_some(), "missing handler for {}", action);
        }
    }
}
