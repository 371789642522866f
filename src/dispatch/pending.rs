//! Pending-request table
//!
//! Correlates station-initiated Calls with the CallResult/CallError the
//! CSMS answers with. Keyed by (station id, unique id) — unique ids are
//! per-station-scoped, never assumed globally unique. Every entry resolves
//! exactly once: with the result payload, a CallError, a timeout, or a
//! disconnect.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::CommandError;

struct PendingRequest {
    action: String,
    sent_at: DateTime<Utc>,
    tx: oneshot::Sender<Result<Value, CommandError>>,
}

#[derive(Default)]
pub struct PendingRequestTable {
    inner: DashMap<(String, String), PendingRequest>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly sent Call; the receiver resolves exactly once.
    pub fn register(
        &self,
        station_id: &str,
        unique_id: &str,
        action: &str,
    ) -> oneshot::Receiver<Result<Value, CommandError>> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(
            (station_id.to_string(), unique_id.to_string()),
            PendingRequest {
                action: action.to_string(),
                sent_at: Utc::now(),
                tx,
            },
        );
        rx
    }

    /// Resolve with a CallResult payload. Returns the action of the
    /// original Call, or `None` for an orphan response.
    pub fn resolve_result(&self, station_id: &str, unique_id: &str, payload: Value) -> Option<String> {
        let key = (station_id.to_string(), unique_id.to_string());
        match self.inner.remove(&key) {
            Some((_, pending)) => {
                debug!(
                    station_id,
                    unique_id,
                    action = pending.action.as_str(),
                    elapsed_ms = (Utc::now() - pending.sent_at).num_milliseconds(),
                    "Pending request resolved"
                );
                let _ = pending.tx.send(Ok(payload));
                Some(pending.action)
            }
            None => None,
        }
    }

    /// Resolve with a CallError. Returns the action of the original Call.
    pub fn resolve_error(
        &self,
        station_id: &str,
        unique_id: &str,
        error: CommandError,
    ) -> Option<String> {
        let key = (station_id.to_string(), unique_id.to_string());
        match self.inner.remove(&key) {
            Some((_, pending)) => {
                warn!(
                    station_id,
                    unique_id,
                    action = pending.action.as_str(),
                    error = %error,
                    "Pending request failed"
                );
                let _ = pending.tx.send(Err(error));
                Some(pending.action)
            }
            None => None,
        }
    }

    /// Drop a pending entry without resolving its sink (timeout path: the
    /// waiter has already given up).
    pub fn remove(&self, station_id: &str, unique_id: &str) -> Option<String> {
        let key = (station_id.to_string(), unique_id.to_string());
        self.inner.remove(&key).map(|(_, p)| p.action)
    }

    /// Resolve every pending request for a station with `Disconnected`.
    pub fn fail_station(&self, station_id: &str) -> usize {
        let keys: Vec<(String, String)> = self
            .inner
            .iter()
            .filter(|entry| entry.key().0 == station_id)
            .map(|entry| entry.key().clone())
            .collect();
        let count = keys.len();
        for key in keys {
            if let Some((_, pending)) = self.inner.remove(&key) {
                let _ = pending.tx.send(Err(CommandError::Disconnected));
            }
        }
        if count > 0 {
            warn!(station_id, count, "Failed pending requests on disconnect");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_exactly_once_with_result() {
        let table = PendingRequestTable::new();
        let rx = table.register("CP-1", "u1", "Heartbeat");

        let action = table.resolve_result("CP-1", "u1", json!({"currentTime": "t"}));
        assert_eq!(action.as_deref(), Some("Heartbeat"));

        // Second resolution finds nothing
        assert!(table.resolve_result("CP-1", "u1", json!({})).is_none());

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["currentTime"], "t");
    }

    #[tokio::test]
    async fn error_resolution_carries_code() {
        let table = PendingRequestTable::new();
        let rx = table.register("CP-1", "u1", "Authorize");
        table.resolve_error(
            "CP-1",
            "u1",
            CommandError::CallError {
                code: crate::ocpp::CallErrorCode::InternalError,
                description: "boom".into(),
            },
        );
        assert!(matches!(
            rx.await.unwrap(),
            Err(CommandError::CallError { .. })
        ));
    }

    #[tokio::test]
    async fn unique_ids_are_station_scoped() {
        let table = PendingRequestTable::new();
        let rx_a = table.register("CP-A", "u1", "Heartbeat");
        let _rx_b = table.register("CP-B", "u1", "Authorize");

        // Resolving CP-A's u1 must not touch CP-B's
        table.resolve_result("CP-A", "u1", json!({}));
        assert!(rx_a.await.unwrap().is_ok());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_fails_only_that_station() {
        let table = PendingRequestTable::new();
        let rx_a = table.register("CP-A", "u1", "Heartbeat");
        let rx_a2 = table.register("CP-A", "u2", "Authorize");
        let _rx_b = table.register("CP-B", "u1", "Heartbeat");

        assert_eq!(table.fail_station("CP-A"), 2);
        assert!(matches!(rx_a.await.unwrap(), Err(CommandError::Disconnected)));
        assert!(matches!(rx_a2.await.unwrap(), Err(CommandError::Disconnected)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn removed_entry_leaves_waiter_unresolved() {
        let table = PendingRequestTable::new();
        let rx = table.register("CP-1", "u1", "Heartbeat");
        assert_eq!(table.remove("CP-1", "u1").as_deref(), Some("Heartbeat"));
        // Sender dropped without sending
        assert!(rx.await.is_err());
    }
}
