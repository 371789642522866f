//! Connection pool — registry of per-station WebSocket clients

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::client::{ClientError, ClientStatsSnapshot, WsClient};

/// Aggregate pool statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub connected: usize,
    pub broadcast_dropped: u64,
}

/// Thread-safe registry of station WebSocket clients keyed by station id.
pub struct ConnectionPool {
    clients: DashMap<String, Arc<WsClient>>,
    /// Frames dropped by broadcast because a per-client queue was full
    broadcast_dropped: AtomicU64,
}

/// Shared, reference-counted connection pool
pub type SharedConnectionPool = Arc<ConnectionPool>;

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            broadcast_dropped: AtomicU64::new(0),
        }
    }

    pub fn shared() -> SharedConnectionPool {
        Arc::new(Self::new())
    }

    /// Register a client. An existing client under the same id is closed
    /// and replaced.
    pub fn add(&self, station_id: &str, client: Arc<WsClient>) {
        if let Some(old) = self.clients.insert(station_id.to_string(), client) {
            warn!(station_id, "Replacing existing client in pool");
            old.close();
        }
        info!(station_id, "Client added to pool");
        metrics::gauge!("ocpp_pool_clients").set(self.clients.len() as f64);
    }

    /// Close and remove a client.
    pub fn remove(&self, station_id: &str) {
        if let Some((_, client)) = self.clients.remove(station_id) {
            client.close();
            info!(station_id, "Client removed from pool");
        }
        metrics::gauge!("ocpp_pool_clients").set(self.clients.len() as f64);
    }

    pub fn get(&self, station_id: &str) -> Option<Arc<WsClient>> {
        self.clients.get(station_id).map(|entry| entry.value().clone())
    }

    /// Send a frame through a station's client.
    pub fn send(&self, station_id: &str, text: String) -> Result<(), ClientError> {
        match self.clients.get(station_id) {
            Some(client) => client.send(text),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Send a frame to every client. A saturated per-client queue drops the
    /// frame for that client only; the broadcast never aborts.
    pub fn broadcast(&self, text: &str) -> usize {
        let mut delivered = 0;
        for entry in self.clients.iter() {
            match entry.value().send(text.to_string()) {
                Ok(()) => delivered += 1,
                Err(ClientError::QueueFull) => {
                    self.broadcast_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        station_id = entry.key().as_str(),
                        "Broadcast dropped: send queue full"
                    );
                }
                Err(e) => {
                    warn!(
                        station_id = entry.key().as_str(),
                        error = %e,
                        "Broadcast skipped"
                    );
                }
            }
        }
        delivered
    }

    pub fn is_connected(&self, station_id: &str) -> bool {
        self.clients
            .get(station_id)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.clients.iter().filter(|c| c.is_connected()).count()
    }

    pub fn total_count(&self) -> usize {
        self.clients.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total_count(),
            connected: self.connected_count(),
            broadcast_dropped: self.broadcast_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn stats_all(&self) -> HashMap<String, ClientStatsSnapshot> {
        self.clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Close every client (shutdown path).
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().close();
        }
        self.clients.clear();
        metrics::gauge!("ocpp_pool_clients").set(0.0);
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OcppVersion;
    use crate::transport::client::{NoopEvents, WsClientConfig};

    fn idle_client(id: &str) -> Arc<WsClient> {
        let config = WsClientConfig::new(id, format!("ws://127.0.0.1:1/{}", id), OcppVersion::V16);
        WsClient::new(config, Arc::new(NoopEvents))
    }

    #[tokio::test]
    async fn add_remove_and_counts() {
        let pool = ConnectionPool::new();
        pool.add("CP-1", idle_client("CP-1"));
        pool.add("CP-2", idle_client("CP-2"));
        assert_eq!(pool.total_count(), 2);
        // Never connected
        assert_eq!(pool.connected_count(), 0);

        let stats = pool.stats_all();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["CP-1"].station_id, "CP-1");

        pool.remove("CP-1");
        assert_eq!(pool.total_count(), 1);
        assert!(pool.get("CP-1").is_none());
    }

    #[tokio::test]
    async fn send_to_unknown_station_fails() {
        let pool = ConnectionPool::new();
        assert!(matches!(
            pool.send("CP-404", "[]".to_string()),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn broadcast_skips_disconnected_clients() {
        let pool = ConnectionPool::new();
        pool.add("CP-1", idle_client("CP-1"));
        pool.add("CP-2", idle_client("CP-2"));
        // No client is connected, so nothing is delivered and nothing panics.
        assert_eq!(pool.broadcast("[2,\"u\",\"Heartbeat\",{}]"), 0);
    }

    #[tokio::test]
    async fn replacing_client_closes_old_one() {
        let pool = ConnectionPool::new();
        let old = idle_client("CP-1");
        pool.add("CP-1", old.clone());
        pool.add("CP-1", idle_client("CP-1"));
        assert_eq!(pool.total_count(), 1);
        assert_eq!(old.state(), crate::transport::ClientState::Closed);
    }
}
