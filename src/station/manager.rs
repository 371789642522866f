//! Station manager — registry, operations, and the persistence sync loop
//!
//! Lock ordering: the registry map guard is never held while a station
//! lock is acquired. The sync loop snapshots the set of `Arc<Station>`
//! references first, releases the map, then locks each station
//! individually to copy its data. A station removed concurrently still
//! holds its reference; persisting it once more is harmless.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::broadcast::SharedBroadcaster;
use crate::dispatch::SharedMessageRouter;
use crate::domain::{
    ConnectorRuntime, ConnectorStatus, DomainError, DomainResult, StationConfig, StationSnapshot,
};
use crate::messagelog::SharedMessageLog;
use crate::persistence::SharedStore;
use crate::shared::shutdown::ShutdownSignal;
use crate::transport::SharedConnectionPool;

use super::station::{Station, StationDefaults};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    pub total_stations: usize,
    pub enabled_stations: usize,
    pub connected_stations: usize,
    pub charging_connectors: usize,
    pub active_transactions: usize,
}

/// Authoritative registry of stations.
pub struct StationManager {
    stations: DashMap<String, Arc<Station>>,
    pool: SharedConnectionPool,
    router: SharedMessageRouter,
    log: SharedMessageLog,
    broadcaster: SharedBroadcaster,
    store: SharedStore,
    defaults: StationDefaults,
    sync_interval: Duration,
    max_stations: usize,
}

pub type SharedStationManager = Arc<StationManager>;

impl StationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SharedConnectionPool,
        router: SharedMessageRouter,
        log: SharedMessageLog,
        broadcaster: SharedBroadcaster,
        store: SharedStore,
        defaults: StationDefaults,
        sync_interval: Duration,
        max_stations: usize,
    ) -> SharedStationManager {
        Arc::new(Self {
            stations: DashMap::new(),
            pool,
            router,
            log,
            broadcaster,
            store,
            defaults,
            sync_interval,
            max_stations,
        })
    }

    pub fn message_log(&self) -> &SharedMessageLog {
        &self.log
    }

    // ── Registry operations ────────────────────────────────

    pub async fn add_station(&self, config: StationConfig) -> DomainResult<Arc<Station>> {
        config.validate()?;
        if self.stations.contains_key(&config.id) {
            return Err(DomainError::StationAlreadyExists(config.id));
        }
        if self.max_stations > 0 && self.stations.len() >= self.max_stations {
            return Err(DomainError::InvalidState(format!(
                "station limit reached ({})",
                self.max_stations
            )));
        }

        let auto_start = config.auto_start && config.enabled;
        let station_id = config.id.clone();
        let station = Station::new(
            config,
            self.defaults.clone(),
            self.router.clone(),
            self.pool.clone(),
            self.store.clone(),
            self.broadcaster.clone(),
        );
        self.stations.insert(station_id.clone(), station.clone());
        metrics::gauge!("ocpp_registered_stations").set(self.stations.len() as f64);

        if let Err(e) = self.store.upsert_station(station.snapshot().await).await {
            warn!(station_id = station_id.as_str(), error = %e, "Station persist failed");
        }
        self.broadcaster
            .broadcast_change("station", json!({ "stationId": station_id, "event": "added" }));
        info!(station_id = station_id.as_str(), "Station registered");

        if auto_start {
            if let Err(e) = station.start().await {
                warn!(station_id = station_id.as_str(), error = %e, "Auto-start failed");
            }
        }
        Ok(station)
    }

    pub async fn remove_station(&self, id: &str) -> DomainResult<()> {
        let station = self.get_station(id)?;
        station.stop().await?;
        self.stations.remove(id);
        metrics::gauge!("ocpp_registered_stations").set(self.stations.len() as f64);
        if let Err(e) = self.store.delete_station(id).await {
            warn!(station_id = id, error = %e, "Station delete failed");
        }
        self.broadcaster
            .broadcast_change("station", json!({ "stationId": id, "event": "removed" }));
        info!(station_id = id, "Station removed");
        Ok(())
    }

    pub async fn update_station(&self, id: &str, config: StationConfig) -> DomainResult<()> {
        let station = self.get_station(id)?;
        station.update_config(config).await?;
        if let Err(e) = self.store.upsert_station(station.snapshot().await).await {
            warn!(station_id = id, error = %e, "Station persist failed");
        }
        self.broadcaster
            .broadcast_change("station", json!({ "stationId": id, "event": "updated" }));
        Ok(())
    }

    pub fn get_station(&self, id: &str) -> DomainResult<Arc<Station>> {
        self.stations
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DomainError::StationNotFound(id.to_string()))
    }

    // ── Station operations ─────────────────────────────────

    pub async fn start_station(&self, id: &str) -> DomainResult<()> {
        self.get_station(id)?.start().await
    }

    pub async fn stop_station(&self, id: &str) -> DomainResult<()> {
        self.get_station(id)?.stop().await
    }

    pub async fn reset_station(&self, id: &str, hard: bool) -> DomainResult<()> {
        let station = self.get_station(id)?;
        station.begin_reset(hard).await;
        Ok(())
    }

    pub async fn start_charging(
        &self,
        id: &str,
        connector_id: Option<u32>,
        id_tag: Option<String>,
    ) -> DomainResult<i64> {
        self.get_station(id)?.start_charging(connector_id, id_tag).await
    }

    pub async fn stop_charging(
        &self,
        id: &str,
        connector_id: u32,
        reason: Option<String>,
    ) -> DomainResult<i64> {
        self.get_station(id)?.stop_charging(connector_id, reason).await
    }

    pub async fn send_heartbeat(&self, id: &str) -> DomainResult<()> {
        self.get_station(id)?.send_heartbeat().await
    }

    /// Raw frame passthrough, bypassing the encoder (scenario harness).
    pub fn send_custom_message(&self, id: &str, raw: String) -> DomainResult<()> {
        self.get_station(id)?.send_custom(raw)
    }

    // ── Observers ──────────────────────────────────────────

    pub async fn get_connectors(&self, id: &str) -> DomainResult<Vec<(u32, ConnectorRuntime)>> {
        Ok(self.get_station(id)?.connectors().await)
    }

    pub fn is_station_connected(&self, id: &str) -> bool {
        self.pool.is_connected(id)
    }

    pub async fn get_all_stations(&self) -> Vec<StationSnapshot> {
        let stations: Vec<Arc<Station>> = self
            .stations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut snapshots = Vec::with_capacity(stations.len());
        for station in stations {
            snapshots.push(station.snapshot().await);
        }
        snapshots
    }

    pub async fn get_stats(&self) -> ManagerStats {
        let stations: Vec<Arc<Station>> = self
            .stations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut enabled = 0;
        let mut charging = 0;
        let mut transactions = 0;
        for station in &stations {
            let snapshot = station.snapshot().await;
            if snapshot.config.enabled {
                enabled += 1;
            }
            charging += snapshot
                .connectors
                .iter()
                .filter(|(_, c)| c.status == ConnectorStatus::Charging)
                .count();
            transactions += snapshot.active_transaction_ids().len();
        }

        ManagerStats {
            total_stations: stations.len(),
            enabled_stations: enabled,
            connected_stations: self.pool.connected_count(),
            charging_connectors: charging,
            active_transactions: transactions,
        }
    }

    // ── Sync loop ──────────────────────────────────────────

    /// Start the periodic persistence sync.
    pub fn start_sync_loop(self: &Arc<Self>, shutdown: ShutdownSignal) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.sync_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // immediate first tick
            let mut shutdown_watch = shutdown.watcher();
            info!(
                interval_secs = manager.sync_interval.as_secs(),
                "Station sync loop started"
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.sync_once().await;
                    }
                    _ = shutdown_watch.stopped() => {
                        // Final sync so runtime state survives restarts
                        manager.sync_once().await;
                        info!("Station sync loop stopped");
                        return;
                    }
                }
            }
        });
    }

    /// One sync pass. Station references are collected first; each station
    /// lock is then taken individually, never under the registry map.
    pub async fn sync_once(&self) {
        let stations: Vec<Arc<Station>> = self
            .stations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut synced = 0usize;
        for station in stations {
            let snapshot = station.snapshot().await;
            match self.store.upsert_station(snapshot).await {
                Ok(()) => synced += 1,
                // Recoverable: in-memory state stays authoritative, the
                // next tick retries
                Err(e) => {
                    warn!(station_id = station.id(), error = %e, "Sync persist failed")
                }
            }
        }
        debug!(synced, "Sync pass complete");
        metrics::counter!("ocpp_sync_passes_total").increment(1);
    }

    /// Shutdown path: stop every station.
    pub async fn stop_all(&self) {
        let stations: Vec<Arc<Station>> = self
            .stations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for station in stations {
            if let Err(e) = station.stop().await {
                warn!(station_id = station.id(), error = %e, "Stop failed during shutdown");
            }
        }
    }
}
