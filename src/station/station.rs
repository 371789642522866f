//! Per-station simulator
//!
//! One `Station` owns the configuration and runtime state of a single
//! emulated charge point and drives its protocol conversations: the boot
//! handshake, periodic heartbeats, connector charging flows, meter-value
//! emission, and the station-side answers to CSMS commands.
//!
//! Locking: `inner` is the station lock. It is never held across an
//! outbound request (`send_request` awaits the CSMS response); flows
//! mutate state, release, then talk to the wire.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::broadcast::SharedBroadcaster;
use crate::dispatch::{v16, v201, CommandError, SharedMessageRouter};
use crate::domain::{
    ConnectorRuntime, ConnectorStatus, DomainError, DomainResult, OcppVersion, SessionRecord,
    StationConfig, StationLifecycle, StationRuntime, StationSnapshot, Transaction,
};
use crate::persistence::SharedStore;
use crate::shared::shutdown::ShutdownSignal;
use crate::transport::{
    BackoffPolicy, ClientError, ClientEvents, SharedConnectionPool, TlsSettings, WsClient,
    WsClientConfig,
};

use super::meter::MeterSimulator;
use super::state::{connector_transition, lifecycle_transition, ConnectorEvent, LifecycleEvent};

// ── Outcomes surfaced to the dispatcher ────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    Unlocked,
    UnlockFailed,
    NotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityOutcome {
    Accepted,
    Scheduled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChangeOutcome {
    Accepted,
    Rejected,
    RebootRequired,
    NotSupported,
}

/// One OCPP configuration key (GetConfiguration / ChangeConfiguration,
/// GetVariables / SetVariables in 2.0.1).
#[derive(Debug, Clone)]
pub struct ConfigurationKey {
    pub key: String,
    pub readonly: bool,
    pub value: String,
}

/// Transport and timing defaults applied to every station (from the
/// application configuration).
#[derive(Debug, Clone)]
pub struct StationDefaults {
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub tls: TlsSettings,
}

impl Default for StationDefaults {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 100,
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            tls: TlsSettings::default(),
        }
    }
}

// ── Station ────────────────────────────────────────────────────

struct StationInner {
    config: StationConfig,
    runtime: StationRuntime,
    connectors: BTreeMap<u32, ConnectorRuntime>,
    ocpp_keys: BTreeMap<String, (String, bool)>,
    /// Effective heartbeat cadence: BootNotification interval, else config
    heartbeat_interval: u64,
    /// Cancels the boot/heartbeat/meter tasks of the current connection
    timers: Option<ShutdownSignal>,
    session: Option<SessionRecord>,
    active_transactions: BTreeMap<i64, Transaction>,
    /// Connectors switched Inoperative while a transaction was running;
    /// applied when the transaction ends (ChangeAvailability → Scheduled)
    pending_unavailable: BTreeSet<u32>,
    /// 2.1 display messages keyed by message id
    display_messages: BTreeMap<i64, Value>,
}

pub struct Station {
    id: String,
    version: OcppVersion,
    inner: RwLock<StationInner>,
    tx_seq: AtomicI64,
    event_seq: AtomicU64,
    local_list_version: AtomicI32,
    defaults: StationDefaults,
    router: SharedMessageRouter,
    pool: SharedConnectionPool,
    store: SharedStore,
    broadcaster: SharedBroadcaster,
}

impl std::fmt::Debug for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Station")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Station {
    pub fn new(
        config: StationConfig,
        defaults: StationDefaults,
        router: SharedMessageRouter,
        pool: SharedConnectionPool,
        store: SharedStore,
        broadcaster: SharedBroadcaster,
    ) -> Arc<Self> {
        let connectors = config
            .connectors
            .iter()
            .map(|c| (c.id, ConnectorRuntime::default()))
            .collect();
        let ocpp_keys = seed_configuration_keys(&config);
        let heartbeat_interval = config.simulation.heartbeat_interval_secs;
        Arc::new(Self {
            id: config.id.clone(),
            version: config.protocol_version,
            inner: RwLock::new(StationInner {
                config,
                runtime: StationRuntime::default(),
                connectors,
                ocpp_keys,
                heartbeat_interval,
                timers: None,
                session: None,
                active_transactions: BTreeMap::new(),
                pending_unavailable: BTreeSet::new(),
                display_messages: BTreeMap::new(),
            }),
            tx_seq: AtomicI64::new(0),
            event_seq: AtomicU64::new(0),
            local_list_version: AtomicI32::new(0),
            defaults,
            router,
            pool,
            store,
            broadcaster,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol_version(&self) -> OcppVersion {
        self.version
    }

    pub(crate) fn router(&self) -> &SharedMessageRouter {
        &self.router
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Dial the CSMS and kick off the lifecycle.
    pub async fn start(self: &Arc<Self>) -> DomainResult<()> {
        let ws_config = {
            let mut inner = self.inner.write().await;
            if !inner.config.enabled {
                return Err(DomainError::InvalidState("station is disabled".into()));
            }
            match lifecycle_transition(inner.runtime.lifecycle, LifecycleEvent::StartRequested) {
                Some(next) => {
                    inner.runtime.lifecycle = next;
                    inner.runtime.connection_status = "connecting".into();
                    inner.runtime.last_error = None;
                }
                None => {
                    return Err(DomainError::InvalidState(format!(
                        "cannot start from {:?}",
                        inner.runtime.lifecycle
                    )))
                }
            }
            let mut ws = WsClientConfig::new(
                self.id.clone(),
                inner.config.websocket_url(),
                self.version,
            );
            ws.auth = inner.config.auth.clone();
            ws.tls = self.defaults.tls.clone();
            ws.queue_capacity = self.defaults.queue_capacity;
            ws.ping_interval = self.defaults.ping_interval;
            ws.pong_timeout = self.defaults.pong_timeout;
            ws.connect_timeout = self.defaults.connect_timeout;
            ws.backoff = self.defaults.backoff.clone();
            ws
        };

        let events = Arc::new(StationEvents {
            station: Arc::downgrade(self),
        });
        let client = WsClient::new(ws_config, events);
        self.pool.add(&self.id, client.clone());
        if let Err(e) = client.connect() {
            let mut inner = self.inner.write().await;
            inner.runtime.lifecycle = StationLifecycle::Disconnected;
            inner.runtime.connection_status = "disconnected".into();
            return Err(DomainError::Transport(e.to_string()));
        }
        self.broadcast_station_change().await;
        Ok(())
    }

    /// Graceful disconnect: active transactions are stopped first.
    pub async fn stop(self: &Arc<Self>) -> DomainResult<()> {
        {
            let mut inner = self.inner.write().await;
            match lifecycle_transition(inner.runtime.lifecycle, LifecycleEvent::StopRequested) {
                Some(next) => {
                    inner.runtime.lifecycle = next;
                    inner.runtime.connection_status = "stopping".into();
                }
                None => return Ok(()),
            }
            if let Some(timers) = inner.timers.take() {
                timers.trigger();
            }
        }

        self.stop_all_charging("Local").await;
        self.pool.remove(&self.id);

        {
            let mut inner = self.inner.write().await;
            inner.runtime.lifecycle = StationLifecycle::Disconnected;
            inner.runtime.connection_status = "disconnected".into();
            inner.runtime.connected_at = None;
        }
        self.broadcast_station_change().await;
        info!(station_id = self.id.as_str(), "Station stopped");
        Ok(())
    }

    /// Reset command: stop transactions, drop the connection, reboot.
    pub async fn begin_reset(self: &Arc<Self>, hard: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            info!(station_id = this.id.as_str(), hard, "Reset requested");
            let reason = if hard { "HardReset" } else { "SoftReset" };
            this.stop_all_charging(reason).await;
            // Let the CallResult drain before the socket drops
            tokio::time::sleep(Duration::from_millis(200)).await;
            let boot_delay = {
                let inner = this.inner.read().await;
                Duration::from_millis(inner.config.simulation.boot_delay_ms)
            };
            if let Err(e) = this.stop().await {
                warn!(station_id = this.id.as_str(), error = %e, "Reset stop failed");
            }
            tokio::time::sleep(boot_delay).await;
            if let Err(e) = this.start().await {
                warn!(station_id = this.id.as_str(), error = %e, "Reset restart failed");
            }
        });
    }

    // ── Connection callbacks (from the transport client) ───

    async fn handle_connected(self: &Arc<Self>) {
        let (boot_delay, timers, session) = {
            let mut inner = self.inner.write().await;
            match lifecycle_transition(inner.runtime.lifecycle, LifecycleEvent::SocketConnected) {
                Some(next) => inner.runtime.lifecycle = next,
                // Stopped concurrently; do not boot
                None => return,
            }
            inner.runtime.connected_at = Some(Utc::now());
            inner.runtime.connection_status = "connected".into();

            let timers = ShutdownSignal::new();
            inner.timers = Some(timers.clone());

            let session = SessionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                station_id: self.id.clone(),
                protocol_version: self.version,
                connected_at: Utc::now(),
                disconnected_at: None,
                disconnect_reason: None,
            };
            inner.session = Some(session.clone());

            (
                Duration::from_millis(inner.config.simulation.boot_delay_ms),
                timers,
                session,
            )
        };

        if let Err(e) = self.store.upsert_session(session).await {
            warn!(station_id = self.id.as_str(), error = %e, "Session persist failed");
        }
        self.broadcast_station_change().await;

        let this = self.clone();
        tokio::spawn(async move {
            let mut stop_watch = timers.watcher();
            tokio::select! {
                _ = tokio::time::sleep(boot_delay) => {}
                _ = stop_watch.stopped() => return,
            }
            this.boot_loop(timers).await;
        });
    }

    async fn handle_disconnected(&self, reason: &str) {
        let session = {
            let mut inner = self.inner.write().await;
            if let Some(timers) = inner.timers.take() {
                timers.trigger();
            }
            if let Some(next) =
                lifecycle_transition(inner.runtime.lifecycle, LifecycleEvent::ConnectionLost)
            {
                inner.runtime.lifecycle = next;
                inner.runtime.connection_status = "reconnecting".into();
            }
            inner.session.take().map(|mut s| {
                s.disconnected_at = Some(Utc::now());
                s.disconnect_reason = Some(reason.to_string());
                s
            })
        };

        self.router.fail_pending(&self.id);
        if let Some(session) = session {
            if let Err(e) = self.store.upsert_session(session).await {
                warn!(station_id = self.id.as_str(), error = %e, "Session persist failed");
            }
        }
        self.broadcast_station_change().await;
    }

    async fn handle_terminal(&self, error: &ClientError) {
        let fatal = matches!(
            error,
            ClientError::SubprotocolRejected { .. } | ClientError::Tls(_)
        );
        {
            let mut inner = self.inner.write().await;
            if let Some(timers) = inner.timers.take() {
                timers.trigger();
            }
            inner.runtime.last_error = Some(error.to_string());
            inner.runtime.lifecycle = if fatal {
                StationLifecycle::Faulted
            } else {
                StationLifecycle::Disconnected
            };
            inner.runtime.connection_status = "disconnected".into();
            inner.runtime.connected_at = None;
        }
        self.router.fail_pending(&self.id);
        self.pool.remove(&self.id);
        self.broadcast_station_change().await;
        warn!(station_id = self.id.as_str(), error = %error, "Station transport terminated");
    }

    // ── Boot handshake ─────────────────────────────────────

    async fn boot_loop(self: Arc<Self>, stop: ShutdownSignal) {
        let mut stop_watch = stop.watcher();
        loop {
            if stop.is_triggered() {
                return;
            }
            {
                let mut inner = self.inner.write().await;
                match lifecycle_transition(inner.runtime.lifecycle, LifecycleEvent::BootStarted) {
                    Some(next) => inner.runtime.lifecycle = next,
                    None => return,
                }
            }

            let payload = {
                let inner = self.inner.read().await;
                match self.version {
                    OcppVersion::V16 => v16::outbound::boot_notification(&inner.config),
                    _ => v201::outbound::boot_notification(&inner.config),
                }
            };

            let retry_after = match self
                .router
                .send_request(&self.id, self.version, "BootNotification", payload)
                .await
            {
                Ok(response) => {
                    let ack = match self.version {
                        OcppVersion::V16 => v16::parse_boot_ack(response),
                        _ => v201::parse_boot_ack(response),
                    };
                    match ack {
                        Ok(ack) if ack.status == v16::BootStatus::Accepted => {
                            {
                                let mut inner = self.inner.write().await;
                                if ack.interval_secs > 0 {
                                    inner.heartbeat_interval = ack.interval_secs;
                                    let value = ack.interval_secs.to_string();
                                    if let Some(entry) =
                                        inner.ocpp_keys.get_mut("HeartbeatInterval")
                                    {
                                        entry.0 = value;
                                    }
                                }
                                if let Some(next) = lifecycle_transition(
                                    inner.runtime.lifecycle,
                                    LifecycleEvent::BootAccepted,
                                ) {
                                    inner.runtime.lifecycle = next;
                                    inner.runtime.connection_status = "operational".into();
                                }
                            }
                            self.enter_operational(stop.clone()).await;
                            return;
                        }
                        Ok(ack) => {
                            info!(
                                station_id = self.id.as_str(),
                                status = ?ack.status,
                                interval = ack.interval_secs,
                                "BootNotification deferred"
                            );
                            Duration::from_secs(ack.interval_secs.max(5))
                        }
                        Err(e) => {
                            warn!(station_id = self.id.as_str(), error = %e, "Bad BootNotification response");
                            Duration::from_secs(10)
                        }
                    }
                }
                Err(CommandError::NotConnected) | Err(CommandError::Disconnected) => {
                    // Reconnection re-triggers the boot handshake
                    return;
                }
                Err(e) => {
                    warn!(station_id = self.id.as_str(), error = %e, "BootNotification failed");
                    Duration::from_secs(10)
                }
            };

            {
                let mut inner = self.inner.write().await;
                if let Some(next) =
                    lifecycle_transition(inner.runtime.lifecycle, LifecycleEvent::BootDeferred)
                {
                    inner.runtime.lifecycle = next;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(retry_after) => {}
                _ = stop_watch.stopped() => return,
            }
        }
    }

    async fn enter_operational(self: &Arc<Self>, stop: ShutdownSignal) {
        info!(station_id = self.id.as_str(), "Station operational");

        let connectors: Vec<(u32, ConnectorStatus)> = {
            let inner = self.inner.read().await;
            inner
                .connectors
                .iter()
                .map(|(id, c)| (*id, c.status))
                .collect()
        };
        for (connector_id, status) in connectors {
            self.send_status(connector_id, status).await;
        }

        // 2.0.1 security profile: announce the (re)boot
        if self.version != OcppVersion::V16 {
            let this = self.clone();
            tokio::spawn(async move {
                let payload = v201::outbound::security_event_notification("StartupOfTheDevice");
                if let Err(e) = this
                    .router
                    .send_request(&this.id, this.version, "SecurityEventNotification", payload)
                    .await
                {
                    debug!(station_id = this.id.as_str(), error = %e, "SecurityEventNotification failed");
                }
            });
        }

        let heartbeat = self.clone();
        let heartbeat_stop = stop.clone();
        tokio::spawn(async move { heartbeat.heartbeat_task(heartbeat_stop).await });

        let meter = self.clone();
        tokio::spawn(async move { meter.meter_task(stop).await });

        self.broadcast_station_change().await;
    }

    // ── Periodic emitters ──────────────────────────────────

    async fn heartbeat_task(self: Arc<Self>, stop: ShutdownSignal) {
        let mut stop_watch = stop.watcher();
        loop {
            // Re-read each turn so ChangeConfiguration takes effect on the
            // next cycle
            let interval = { self.inner.read().await.heartbeat_interval.max(1) };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                    if let Err(e) = self.send_heartbeat().await {
                        debug!(station_id = self.id.as_str(), error = %e, "Heartbeat failed");
                    }
                }
                _ = stop_watch.stopped() => return,
            }
        }
    }

    pub async fn send_heartbeat(&self) -> DomainResult<()> {
        let payload = match self.version {
            OcppVersion::V16 => v16::outbound::heartbeat(),
            _ => v201::outbound::heartbeat(),
        };
        let response = self
            .router
            .send_request(&self.id, self.version, "Heartbeat", payload)
            .await
            .map_err(|e| DomainError::Transport(e.to_string()))?;
        if self.version == OcppVersion::V16 {
            if let Ok(csms_time) = v16::parse_heartbeat_ack(response) {
                debug!(station_id = self.id.as_str(), %csms_time, "Heartbeat acknowledged");
            }
        }
        let mut inner = self.inner.write().await;
        inner.runtime.last_heartbeat = Some(Utc::now());
        Ok(())
    }

    /// Station-initiated DataTransfer toward the CSMS.
    pub async fn send_data_transfer(
        &self,
        message_id: Option<&str>,
        data: Option<&str>,
    ) -> DomainResult<Value> {
        let vendor = { self.inner.read().await.config.vendor.clone() };
        let payload = v16::outbound::data_transfer(&vendor, message_id, data);
        self.router
            .send_request(&self.id, self.version, "DataTransfer", payload)
            .await
            .map_err(|e| DomainError::Transport(e.to_string()))
    }

    async fn meter_task(self: Arc<Self>, stop: ShutdownSignal) {
        let mut stop_watch = stop.watcher();
        let mut last_tick = tokio::time::Instant::now();
        loop {
            let interval = {
                self.inner.read().await.config.meter.sample_interval_secs.max(1)
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    last_tick = tokio::time::Instant::now();
                    self.meter_tick(elapsed).await;
                }
                _ = stop_watch.stopped() => return,
            }
        }
    }

    /// Advance charging connectors by `elapsed_secs` and emit one
    /// MeterValues (or TransactionEvent Updated) per charging connector.
    pub async fn meter_tick(&self, elapsed_secs: f64) {
        let samples: Vec<(u32, Option<i64>, f64)> = {
            let mut inner = self.inner.write().await;
            let simulator = MeterSimulator::new(
                inner.config.simulation.energy_delivery_rate_w,
                inner.config.simulation.randomize,
                inner.config.simulation.variance,
            );
            // rng stays inside the lock scope; it must not cross an await
            let mut rng = rand::thread_rng();
            inner
                .connectors
                .iter_mut()
                .filter(|(_, c)| c.status == ConnectorStatus::Charging)
                .map(|(id, c)| {
                    if elapsed_secs > 0.0 {
                        c.meter_wh += simulator.sample(elapsed_secs, &mut rng);
                    }
                    (*id, c.transaction_id, c.meter_wh)
                })
                .collect()
        };

        if samples.is_empty() {
            return;
        }

        for (connector_id, transaction_id, value_wh) in &samples {
            let (action, payload) = match self.version {
                OcppVersion::V16 => (
                    "MeterValues",
                    v16::outbound::meter_values(*connector_id, *transaction_id, *value_wh),
                ),
                _ => (
                    "TransactionEvent",
                    v201::outbound::transaction_event(&v201::outbound::TransactionEvent {
                        event_type: "Updated",
                        trigger_reason: "MeterValuePeriodic",
                        seq_no: self.event_seq.fetch_add(1, Ordering::SeqCst),
                        transaction_id: transaction_id.unwrap_or_default(),
                        charging_state: Some("Charging"),
                        evse_id: *connector_id,
                        id_token: None,
                        meter_wh: Some(*value_wh),
                        stopped_reason: None,
                    }),
                ),
            };
            if let Err(e) = self
                .router
                .send_request(&self.id, self.version, action, payload)
                .await
            {
                debug!(station_id = self.id.as_str(), error = %e, "Meter emission failed");
            }
        }

        let records = samples
            .iter()
            .map(|(connector_id, transaction_id, value_wh)| crate::domain::MeterSample {
                station_id: self.id.clone(),
                connector_id: *connector_id,
                transaction_id: *transaction_id,
                value_wh: *value_wh,
                timestamp: Utc::now(),
            })
            .collect();
        if let Err(e) = self.store.insert_meter_samples(records).await {
            debug!(station_id = self.id.as_str(), error = %e, "Meter sample persist failed");
        }
    }

    // ── Charging flows ─────────────────────────────────────

    fn next_local_tx(&self) -> i64 {
        self.tx_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Validate and mark the target connector Preparing. The returned id is
    /// reserved for the caller's charge flow.
    async fn reserve_connector(&self, requested: Option<u32>) -> DomainResult<u32> {
        let mut inner = self.inner.write().await;
        if inner.runtime.lifecycle != StationLifecycle::Operational {
            return Err(DomainError::InvalidState(
                "station is not operational".into(),
            ));
        }
        let connector_id = match requested {
            Some(id) => {
                let connector = inner
                    .connectors
                    .get(&id)
                    .ok_or(DomainError::ConnectorNotFound(id))?;
                if connector_transition(connector.status, ConnectorEvent::StartRequested).is_none()
                {
                    return Err(DomainError::InvalidState(format!(
                        "connector {} is {:?}",
                        id, connector.status
                    )));
                }
                id
            }
            None => inner
                .connectors
                .iter()
                .find(|(_, c)| {
                    connector_transition(c.status, ConnectorEvent::StartRequested).is_some()
                })
                .map(|(id, _)| *id)
                .ok_or_else(|| {
                    DomainError::InvalidState("no available connector".into())
                })?,
        };
        if let Some(connector) = inner.connectors.get_mut(&connector_id) {
            connector.status = ConnectorStatus::Preparing;
            connector.status_changed_at = Utc::now();
        }
        Ok(connector_id)
    }

    async fn default_id_tag(&self) -> String {
        self.inner.read().await.config.simulation.default_id_tag.clone()
    }

    /// Local equivalent of RemoteStartTransaction: runs the full
    /// authorize → start → charging flow and returns the transaction id.
    pub async fn start_charging(
        self: &Arc<Self>,
        connector_id: Option<u32>,
        id_tag: Option<String>,
    ) -> DomainResult<i64> {
        let tag = match id_tag {
            Some(tag) => tag,
            None => self.default_id_tag().await,
        };
        let connector = self.reserve_connector(connector_id).await?;
        self.charge_flow(connector, tag).await
    }

    /// RemoteStartTransaction: validate synchronously, run the
    /// conversation in a spawned task (the handler must not block the read
    /// pump on its own StartTransaction response).
    pub async fn remote_start(
        self: &Arc<Self>,
        connector_id: Option<u32>,
        id_tag: Option<String>,
    ) -> DomainResult<u32> {
        let tag = match id_tag {
            Some(tag) => tag,
            None => self.default_id_tag().await,
        };
        let connector = self.reserve_connector(connector_id).await?;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.charge_flow(connector, tag).await {
                warn!(
                    station_id = this.id.as_str(),
                    connector_id = connector,
                    error = %e,
                    "Remote start flow failed"
                );
            }
        });
        Ok(connector)
    }

    async fn charge_flow(self: &Arc<Self>, connector_id: u32, id_tag: String) -> DomainResult<i64> {
        self.send_status(connector_id, ConnectorStatus::Preparing).await;

        match self.authorize(&id_tag).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    station_id = self.id.as_str(),
                    id_tag = id_tag.as_str(),
                    "Authorization rejected"
                );
                self.abort_start(connector_id).await;
                return Err(DomainError::InvalidState("authorization rejected".into()));
            }
            Err(e) => {
                self.abort_start(connector_id).await;
                return Err(DomainError::Transport(e.to_string()));
            }
        }

        let meter_start = {
            let inner = self.inner.read().await;
            inner
                .connectors
                .get(&connector_id)
                .map(|c| c.meter_wh)
                .unwrap_or(0.0)
        } as i64;

        let (transaction_id, locally_minted) = match self.version {
            OcppVersion::V16 => {
                let payload =
                    v16::outbound::start_transaction(connector_id, &id_tag, meter_start);
                match self
                    .router
                    .send_request(&self.id, self.version, "StartTransaction", payload)
                    .await
                {
                    Ok(response) => match v16::parse_start_ack(response) {
                        Ok(ack) if ack.accepted => (ack.transaction_id, false),
                        Ok(_) => {
                            self.abort_start(connector_id).await;
                            return Err(DomainError::InvalidState(
                                "StartTransaction rejected".into(),
                            ));
                        }
                        Err(e) => {
                            self.abort_start(connector_id).await;
                            return Err(DomainError::Transport(e.to_string()));
                        }
                    },
                    // No CSMS acknowledged the start: the local counter
                    // stands in and the transaction is flagged.
                    Err(CommandError::Timeout) => (self.next_local_tx(), true),
                    Err(e) => {
                        self.abort_start(connector_id).await;
                        return Err(DomainError::Transport(e.to_string()));
                    }
                }
            }
            OcppVersion::V201 | OcppVersion::V21 => {
                let tx_id = self.next_local_tx();
                let payload =
                    v201::outbound::transaction_event(&v201::outbound::TransactionEvent {
                        event_type: "Started",
                        trigger_reason: "RemoteStart",
                        seq_no: self.event_seq.fetch_add(1, Ordering::SeqCst),
                        transaction_id: tx_id,
                        charging_state: Some("Charging"),
                        evse_id: connector_id,
                        id_token: Some(&id_tag),
                        meter_wh: Some(meter_start as f64),
                        stopped_reason: None,
                    });
                match self
                    .router
                    .send_request(&self.id, self.version, "TransactionEvent", payload)
                    .await
                {
                    Ok(_) | Err(CommandError::Timeout) => (tx_id, false),
                    Err(e) => {
                        self.abort_start(connector_id).await;
                        return Err(DomainError::Transport(e.to_string()));
                    }
                }
            }
        };

        let transaction = {
            let mut inner = self.inner.write().await;
            let connector = inner
                .connectors
                .get_mut(&connector_id)
                .ok_or(DomainError::ConnectorNotFound(connector_id))?;
            match connector_transition(connector.status, ConnectorEvent::TransactionStarted) {
                Some(next) => {
                    connector.status = next;
                    connector.status_changed_at = Utc::now();
                    connector.transaction_id = Some(transaction_id);
                }
                None => {
                    return Err(DomainError::InvalidState(format!(
                        "connector {} left Preparing during start",
                        connector_id
                    )))
                }
            }
            inner.runtime.current_transaction_id = Some(transaction_id);
            let mut transaction =
                Transaction::start(transaction_id, &self.id, connector_id, &id_tag, meter_start);
            transaction.locally_minted = locally_minted;
            inner
                .active_transactions
                .insert(transaction_id, transaction.clone());
            transaction
        };

        if let Err(e) = self.store.upsert_transaction(transaction).await {
            warn!(station_id = self.id.as_str(), error = %e, "Transaction persist failed");
        }
        self.send_status(connector_id, ConnectorStatus::Charging).await;
        self.broadcast_connector_change(connector_id).await;
        metrics::counter!("ocpp_transactions_total", "phase" => "started").increment(1);
        info!(
            station_id = self.id.as_str(),
            connector_id,
            transaction_id,
            locally_minted,
            "Charging started"
        );
        Ok(transaction_id)
    }

    async fn abort_start(&self, connector_id: u32) {
        {
            let mut inner = self.inner.write().await;
            if let Some(connector) = inner.connectors.get_mut(&connector_id) {
                if let Some(next) =
                    connector_transition(connector.status, ConnectorEvent::StartAborted)
                {
                    connector.status = next;
                    connector.status_changed_at = Utc::now();
                }
            }
        }
        self.send_status(connector_id, ConnectorStatus::Available).await;
    }

    /// Local equivalent of RemoteStopTransaction.
    pub async fn stop_charging(
        self: &Arc<Self>,
        connector_id: u32,
        reason: Option<String>,
    ) -> DomainResult<i64> {
        self.stop_flow(connector_id, reason).await
    }

    /// RemoteStopTransaction: resolve the owning connector synchronously,
    /// run the stop conversation in a spawned task.
    pub async fn remote_stop(self: &Arc<Self>, transaction_id: i64) -> DomainResult<u32> {
        let connector_id = {
            let inner = self.inner.read().await;
            inner
                .connectors
                .iter()
                .find(|(_, c)| {
                    c.transaction_id == Some(transaction_id)
                        && connector_transition(c.status, ConnectorEvent::StopRequested).is_some()
                })
                .map(|(id, _)| *id)
                .ok_or(DomainError::TransactionNotFound(transaction_id))?
        };
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.stop_flow(connector_id, Some("Remote".into())).await {
                warn!(
                    station_id = this.id.as_str(),
                    connector_id,
                    error = %e,
                    "Remote stop flow failed"
                );
            }
        });
        Ok(connector_id)
    }

    async fn stop_flow(
        self: &Arc<Self>,
        connector_id: u32,
        reason: Option<String>,
    ) -> DomainResult<i64> {
        let (transaction_id, meter_stop, transaction) = {
            let mut inner = self.inner.write().await;
            let connector = inner
                .connectors
                .get_mut(&connector_id)
                .ok_or(DomainError::ConnectorNotFound(connector_id))?;
            let next = connector_transition(connector.status, ConnectorEvent::StopRequested)
                .ok_or_else(|| {
                    DomainError::InvalidState(format!(
                        "connector {} is {:?}, nothing to stop",
                        connector_id, connector.status
                    ))
                })?;
            let transaction_id = connector.transaction_id.ok_or_else(|| {
                DomainError::InvalidState(format!("connector {} has no transaction", connector_id))
            })?;
            connector.status = next;
            connector.status_changed_at = Utc::now();
            let meter_stop = connector.meter_wh as i64;
            let transaction = inner.active_transactions.remove(&transaction_id);
            (transaction_id, meter_stop, transaction)
        };

        self.send_status(connector_id, ConnectorStatus::Finishing).await;

        let (action, payload) = match self.version {
            OcppVersion::V16 => (
                "StopTransaction",
                v16::outbound::stop_transaction(transaction_id, meter_stop, reason.as_deref()),
            ),
            _ => (
                "TransactionEvent",
                v201::outbound::transaction_event(&v201::outbound::TransactionEvent {
                    event_type: "Ended",
                    trigger_reason: "RemoteStop",
                    seq_no: self.event_seq.fetch_add(1, Ordering::SeqCst),
                    transaction_id,
                    charging_state: None,
                    evse_id: connector_id,
                    id_token: None,
                    meter_wh: Some(meter_stop as f64),
                    stopped_reason: reason.as_deref(),
                }),
            ),
        };
        if let Err(e) = self
            .router
            .send_request(&self.id, self.version, action, payload)
            .await
        {
            // The stop is locally authoritative; the CSMS outage is logged
            // and the transaction still completes.
            warn!(station_id = self.id.as_str(), error = %e, "Stop acknowledgement failed");
        }

        let mut record = transaction.unwrap_or_else(|| {
            Transaction::start(transaction_id, &self.id, connector_id, "", meter_stop)
        });
        record.complete(meter_stop, reason);
        if let Err(e) = self.store.upsert_transaction(record).await {
            warn!(station_id = self.id.as_str(), error = %e, "Transaction persist failed");
        }

        let final_status = {
            let mut inner = self.inner.write().await;
            let pending_unavailable = inner.pending_unavailable.remove(&connector_id);
            if inner.runtime.current_transaction_id == Some(transaction_id) {
                inner.runtime.current_transaction_id = None;
            }
            let connector = inner
                .connectors
                .get_mut(&connector_id)
                .ok_or(DomainError::ConnectorNotFound(connector_id))?;
            connector.transaction_id = None;
            connector.status = if pending_unavailable {
                ConnectorStatus::Unavailable
            } else {
                ConnectorStatus::Available
            };
            connector.status_changed_at = Utc::now();
            connector.status
        };

        self.send_status(connector_id, final_status).await;
        self.broadcast_connector_change(connector_id).await;
        metrics::counter!("ocpp_transactions_total", "phase" => "stopped").increment(1);
        info!(
            station_id = self.id.as_str(),
            connector_id, transaction_id, "Charging stopped"
        );
        Ok(transaction_id)
    }

    async fn stop_all_charging(self: &Arc<Self>, reason: &str) {
        let connector_ids: Vec<u32> = {
            let inner = self.inner.read().await;
            inner
                .connectors
                .iter()
                .filter(|(_, c)| {
                    c.transaction_id.is_some()
                        && connector_transition(c.status, ConnectorEvent::StopRequested).is_some()
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for connector_id in connector_ids {
            if let Err(e) = self.stop_flow(connector_id, Some(reason.to_string())).await {
                warn!(
                    station_id = self.id.as_str(),
                    connector_id,
                    error = %e,
                    "Stop-all failed for connector"
                );
            }
        }
    }

    /// Suspension branches from Charging (EV-side or EVSE-side).
    pub async fn suspend_charging(&self, connector_id: u32, by_ev: bool) -> DomainResult<()> {
        let event = if by_ev {
            ConnectorEvent::SuspendByEv
        } else {
            ConnectorEvent::SuspendByEvse
        };
        let status = self.apply_connector_event(connector_id, event).await?;
        self.send_status(connector_id, status).await;
        Ok(())
    }

    pub async fn resume_charging(&self, connector_id: u32) -> DomainResult<()> {
        let status = self
            .apply_connector_event(connector_id, ConnectorEvent::Resume)
            .await?;
        self.send_status(connector_id, status).await;
        Ok(())
    }

    /// Local fault injection; exits only to Available on clearance. A
    /// transaction interrupted by the fault is failed and released so a
    /// faulted connector never holds a transaction reference.
    pub async fn set_fault(&self, connector_id: u32, faulted: bool) -> DomainResult<()> {
        let event = if faulted {
            ConnectorEvent::Fault
        } else {
            ConnectorEvent::FaultCleared
        };
        let status = self.apply_connector_event(connector_id, event).await?;

        if faulted {
            let failed = {
                let mut inner = self.inner.write().await;
                let interrupted = inner
                    .connectors
                    .get_mut(&connector_id)
                    .and_then(|c| c.transaction_id.take());
                if let Some(tx_id) = interrupted {
                    if inner.runtime.current_transaction_id == Some(tx_id) {
                        inner.runtime.current_transaction_id = None;
                    }
                    inner.active_transactions.remove(&tx_id).map(|mut tx| {
                        tx.fail("ConnectorFault");
                        tx
                    })
                } else {
                    None
                }
            };
            if let Some(tx) = failed {
                if let Err(e) = self.store.upsert_transaction(tx).await {
                    warn!(station_id = self.id.as_str(), error = %e, "Transaction persist failed");
                }
            }
        }

        self.send_status(connector_id, status).await;
        Ok(())
    }

    async fn apply_connector_event(
        &self,
        connector_id: u32,
        event: ConnectorEvent,
    ) -> DomainResult<ConnectorStatus> {
        let mut inner = self.inner.write().await;
        let connector = inner
            .connectors
            .get_mut(&connector_id)
            .ok_or(DomainError::ConnectorNotFound(connector_id))?;
        let next = connector_transition(connector.status, event).ok_or_else(|| {
            DomainError::InvalidState(format!(
                "{:?} is invalid in {:?}",
                event, connector.status
            ))
        })?;
        connector.status = next;
        connector.status_changed_at = Utc::now();
        Ok(next)
    }

    // ── CSMS command backends ──────────────────────────────

    pub async fn unlock_connector(self: &Arc<Self>, connector_id: u32) -> UnlockOutcome {
        let holding = {
            let inner = self.inner.read().await;
            match inner.connectors.get(&connector_id) {
                Some(c) => c.transaction_id.is_some(),
                None => return UnlockOutcome::NotSupported,
            }
        };
        if holding {
            match self
                .stop_flow(connector_id, Some("UnlockCommand".into()))
                .await
            {
                Ok(_) => UnlockOutcome::Unlocked,
                Err(_) => UnlockOutcome::UnlockFailed,
            }
        } else {
            UnlockOutcome::Unlocked
        }
    }

    /// ChangeAvailability. Connector 0 addresses every connector. A
    /// connector with a running transaction is switched after it ends
    /// (Scheduled).
    pub async fn change_availability(
        self: &Arc<Self>,
        connector_id: u32,
        operative: bool,
    ) -> AvailabilityOutcome {
        let (changed, scheduled) = {
            let mut inner = self.inner.write().await;
            let targets: Vec<u32> = if connector_id == 0 {
                inner.connectors.keys().copied().collect()
            } else if inner.connectors.contains_key(&connector_id) {
                vec![connector_id]
            } else {
                return AvailabilityOutcome::Rejected;
            };

            let mut changed = Vec::new();
            let mut scheduled = false;
            for id in targets {
                let has_tx = inner
                    .connectors
                    .get(&id)
                    .map(|c| c.transaction_id.is_some())
                    .unwrap_or(false);
                if !operative && has_tx {
                    inner.pending_unavailable.insert(id);
                    scheduled = true;
                    continue;
                }
                if operative {
                    inner.pending_unavailable.remove(&id);
                }
                let event = if operative {
                    ConnectorEvent::MakeAvailable
                } else {
                    ConnectorEvent::MakeUnavailable
                };
                if let Some(connector) = inner.connectors.get_mut(&id) {
                    if let Some(next) = connector_transition(connector.status, event) {
                        connector.status = next;
                        connector.status_changed_at = Utc::now();
                        changed.push((id, next));
                    }
                }
            }
            (changed, scheduled)
        };

        for (id, status) in &changed {
            self.send_status(*id, *status).await;
        }
        if scheduled {
            AvailabilityOutcome::Scheduled
        } else {
            AvailabilityOutcome::Accepted
        }
    }

    pub async fn change_configuration(&self, key: &str, value: &str) -> ConfigChangeOutcome {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.ocpp_keys.get(key) else {
            return ConfigChangeOutcome::NotSupported;
        };
        if entry.1 {
            return ConfigChangeOutcome::Rejected;
        }
        match key {
            "HeartbeatInterval" => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    inner.heartbeat_interval = secs;
                }
                _ => return ConfigChangeOutcome::Rejected,
            },
            "MeterValueSampleInterval" => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    inner.config.meter.sample_interval_secs = secs;
                }
                _ => return ConfigChangeOutcome::Rejected,
            },
            _ => {}
        }
        if let Some(entry) = inner.ocpp_keys.get_mut(key) {
            entry.0 = value.to_string();
        }
        ConfigChangeOutcome::Accepted
    }

    pub async fn get_configuration(
        &self,
        keys: Option<Vec<String>>,
    ) -> (Vec<ConfigurationKey>, Vec<String>) {
        let inner = self.inner.read().await;
        match keys {
            None => (
                inner
                    .ocpp_keys
                    .iter()
                    .map(|(key, (value, readonly))| ConfigurationKey {
                        key: key.clone(),
                        readonly: *readonly,
                        value: value.clone(),
                    })
                    .collect(),
                Vec::new(),
            ),
            Some(requested) => {
                let mut known = Vec::new();
                let mut unknown = Vec::new();
                for key in requested {
                    match inner.ocpp_keys.get(&key) {
                        Some((value, readonly)) => known.push(ConfigurationKey {
                            key,
                            readonly: *readonly,
                            value: value.clone(),
                        }),
                        None => unknown.push(key),
                    }
                }
                (known, unknown)
            }
        }
    }

    pub async fn clear_auth_cache(&self) -> bool {
        debug!(station_id = self.id.as_str(), "Authorization cache cleared");
        true
    }

    pub async fn data_transfer(
        &self,
        vendor_id: &str,
        message_id: Option<&str>,
        _data: Option<&str>,
    ) -> (String, Option<String>) {
        let our_vendor = { self.inner.read().await.config.vendor.clone() };
        if vendor_id == our_vendor {
            debug!(
                station_id = self.id.as_str(),
                vendor_id,
                message_id = ?message_id,
                "DataTransfer accepted"
            );
            ("Accepted".to_string(), None)
        } else {
            ("UnknownVendorId".to_string(), None)
        }
    }

    pub async fn trigger_message(
        self: &Arc<Self>,
        trigger: &str,
        connector_id: Option<u32>,
    ) -> bool {
        match trigger {
            "Heartbeat" => {
                let this = self.clone();
                tokio::spawn(async move {
                    let _ = this.send_heartbeat().await;
                });
                true
            }
            "StatusNotification" => {
                let this = self.clone();
                tokio::spawn(async move {
                    let connectors: Vec<(u32, ConnectorStatus)> = {
                        let inner = this.inner.read().await;
                        inner
                            .connectors
                            .iter()
                            .filter(|(id, _)| connector_id.map(|c| c == **id).unwrap_or(true))
                            .map(|(id, c)| (*id, c.status))
                            .collect()
                    };
                    for (id, status) in connectors {
                        this.send_status(id, status).await;
                    }
                });
                true
            }
            "MeterValues" => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.meter_tick(0.0).await;
                });
                true
            }
            "BootNotification" => {
                let this = self.clone();
                tokio::spawn(async move {
                    let payload = {
                        let inner = this.inner.read().await;
                        match this.version {
                            OcppVersion::V16 => v16::outbound::boot_notification(&inner.config),
                            _ => v201::outbound::boot_notification(&inner.config),
                        }
                    };
                    let _ = this
                        .router
                        .send_request(&this.id, this.version, "BootNotification", payload)
                        .await;
                });
                true
            }
            _ => false,
        }
    }

    pub fn local_list_version(&self) -> i32 {
        self.local_list_version.load(Ordering::SeqCst)
    }

    pub fn apply_local_list(&self, version: i32, update_type: &str) -> bool {
        debug!(
            station_id = self.id.as_str(),
            version, update_type, "Local list update"
        );
        self.local_list_version.store(version, Ordering::SeqCst);
        true
    }

    /// GetBaseReport backend: a NotifyReport conversation carrying the
    /// configuration keys.
    pub async fn send_base_report(self: &Arc<Self>, request_id: i64) {
        let this = self.clone();
        tokio::spawn(async move {
            let entries: Vec<Value> = {
                let inner = this.inner.read().await;
                inner
                    .ocpp_keys
                    .iter()
                    .map(|(key, (value, readonly))| {
                        json!({
                            "component": { "name": "ChargingStation" },
                            "variable": { "name": key },
                            "variableAttribute": [{
                                "value": value,
                                "mutability": if *readonly { "ReadOnly" } else { "ReadWrite" },
                            }],
                        })
                    })
                    .collect()
            };
            let payload = v201::outbound::notify_report(request_id, 0, entries);
            if let Err(e) = this
                .router
                .send_request(&this.id, this.version, "NotifyReport", payload)
                .await
            {
                debug!(station_id = this.id.as_str(), error = %e, "NotifyReport failed");
            }
        });
    }

    // ── Display messages (2.1) ─────────────────────────────

    pub async fn set_display_message(&self, message: Value) -> bool {
        let Some(id) = message["id"].as_i64() else {
            return false;
        };
        let mut inner = self.inner.write().await;
        inner.display_messages.insert(id, message);
        true
    }

    pub async fn send_display_messages(self: &Arc<Self>, request_id: i64) -> bool {
        let messages: Vec<Value> = {
            let inner = self.inner.read().await;
            inner.display_messages.values().cloned().collect()
        };
        if messages.is_empty() {
            return false;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let payload = json!({
                "requestId": request_id,
                "tbc": false,
                "messageInfo": messages,
            });
            let _ = this
                .router
                .send_request(&this.id, this.version, "NotifyDisplayMessages", payload)
                .await;
        });
        true
    }

    pub async fn clear_display_message(&self, id: i64) -> bool {
        self.inner.write().await.display_messages.remove(&id).is_some()
    }

    // ── Wire helpers ───────────────────────────────────────

    async fn authorize(&self, id_tag: &str) -> Result<bool, CommandError> {
        let payload = match self.version {
            OcppVersion::V16 => v16::outbound::authorize(id_tag),
            _ => v201::outbound::authorize(id_tag),
        };
        let response = self
            .router
            .send_request(&self.id, self.version, "Authorize", payload)
            .await?;
        match self.version {
            OcppVersion::V16 => v16::parse_authorize_ack(response),
            _ => v201::parse_authorize_ack(response),
        }
    }

    async fn send_status(&self, connector_id: u32, status: ConnectorStatus) {
        let payload = match self.version {
            OcppVersion::V16 => {
                let error_code = if status == ConnectorStatus::Faulted {
                    "InternalError"
                } else {
                    "NoError"
                };
                v16::outbound::status_notification(connector_id, status, error_code)
            }
            _ => v201::outbound::status_notification(connector_id, status),
        };
        if let Err(e) = self
            .router
            .send_request(&self.id, self.version, "StatusNotification", payload)
            .await
        {
            debug!(
                station_id = self.id.as_str(),
                connector_id,
                error = %e,
                "StatusNotification failed"
            );
        }
    }

    /// Raw passthrough for scenarios; bypasses the encoder.
    pub fn send_custom(&self, raw: String) -> DomainResult<()> {
        self.router
            .send_raw(&self.id, self.version, raw)
            .map_err(|e| DomainError::Transport(e.to_string()))
    }

    // ── Observers ──────────────────────────────────────────

    pub async fn lifecycle(&self) -> StationLifecycle {
        self.inner.read().await.runtime.lifecycle
    }

    pub async fn connector_status(&self, connector_id: u32) -> Option<ConnectorStatus> {
        self.inner
            .read()
            .await
            .connectors
            .get(&connector_id)
            .map(|c| c.status)
    }

    pub async fn connectors(&self) -> Vec<(u32, ConnectorRuntime)> {
        self.inner
            .read()
            .await
            .connectors
            .iter()
            .map(|(id, c)| (*id, c.clone()))
            .collect()
    }

    pub async fn has_active_transaction(&self) -> bool {
        self.inner
            .read()
            .await
            .connectors
            .values()
            .any(|c| c.transaction_id.is_some())
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_connected(&self.id)
    }

    pub async fn config(&self) -> StationConfig {
        self.inner.read().await.config.clone()
    }

    /// Apply a configuration update where safe: identity and creation time
    /// are preserved; connector layout only changes while disconnected.
    pub async fn update_config(&self, mut update: StationConfig) -> DomainResult<()> {
        update.validate()?;
        let mut inner = self.inner.write().await;
        if update.id != inner.config.id {
            return Err(DomainError::InvalidConfig(
                "station id cannot be changed".into(),
            ));
        }
        let running = inner.runtime.lifecycle != StationLifecycle::Disconnected;
        let layout_changed = update.connectors.len() != inner.config.connectors.len()
            || update
                .connectors
                .iter()
                .zip(inner.config.connectors.iter())
                .any(|(a, b)| a.id != b.id);
        if running && layout_changed {
            return Err(DomainError::InvalidState(
                "connector layout changes require the station to be stopped".into(),
            ));
        }
        update.created_at = inner.config.created_at;
        update.updated_at = Utc::now();
        if layout_changed {
            inner.connectors = update
                .connectors
                .iter()
                .map(|c| (c.id, ConnectorRuntime::default()))
                .collect();
        }
        if !running {
            inner.heartbeat_interval = update.simulation.heartbeat_interval_secs;
        }
        inner.config = update;
        Ok(())
    }

    /// Full state copy, taken under the station lock and consumed after
    /// release (sync loop, observers).
    pub async fn snapshot(&self) -> StationSnapshot {
        let inner = self.inner.read().await;
        StationSnapshot {
            config: inner.config.clone(),
            runtime: inner.runtime.clone(),
            connectors: inner
                .connectors
                .iter()
                .map(|(id, c)| (*id, c.clone()))
                .collect(),
            snapshot_at: Utc::now(),
        }
    }

    // ── Broadcasts ─────────────────────────────────────────

    async fn broadcast_station_change(&self) {
        let payload = {
            let inner = self.inner.read().await;
            json!({
                "stationId": self.id,
                "lifecycle": inner.runtime.lifecycle,
                "connectionStatus": inner.runtime.connection_status,
            })
        };
        self.broadcaster.broadcast_change("station", payload);
    }

    async fn broadcast_connector_change(&self, connector_id: u32) {
        let payload = {
            let inner = self.inner.read().await;
            match inner.connectors.get(&connector_id) {
                Some(connector) => json!({
                    "stationId": self.id,
                    "connectorId": connector_id,
                    "status": connector.status,
                    "transactionId": connector.transaction_id,
                    "meterWh": connector.meter_wh,
                }),
                None => return,
            }
        };
        self.broadcaster.broadcast_change("connector", payload);
    }
}

fn seed_configuration_keys(config: &StationConfig) -> BTreeMap<String, (String, bool)> {
    let mut keys = BTreeMap::new();
    keys.insert(
        "HeartbeatInterval".to_string(),
        (config.simulation.heartbeat_interval_secs.to_string(), false),
    );
    keys.insert(
        "MeterValueSampleInterval".to_string(),
        (config.meter.sample_interval_secs.to_string(), false),
    );
    keys.insert(
        "MeterValuesSampledData".to_string(),
        (config.meter.measurands.join(","), false),
    );
    keys.insert(
        "ClockAlignedDataInterval".to_string(),
        (config.meter.aligned_data_interval_secs.to_string(), false),
    );
    keys.insert(
        "NumberOfConnectors".to_string(),
        (config.connectors.len().to_string(), true),
    );
    keys.insert(
        "SupportedFeatureProfiles".to_string(),
        (config.feature_profiles.join(","), true),
    );
    keys.insert(
        "AuthorizeRemoteTxRequests".to_string(),
        ("true".to_string(), false),
    );
    keys.insert("LocalAuthListEnabled".to_string(), ("true".to_string(), false));
    keys.insert("LocalAuthListMaxLength".to_string(), ("100".to_string(), true));
    keys
}

// ── Transport event adapter ────────────────────────────────────

struct StationEvents {
    station: std::sync::Weak<Station>,
}

#[async_trait]
impl ClientEvents for StationEvents {
    async fn on_connected(&self) {
        if let Some(station) = self.station.upgrade() {
            station.handle_connected().await;
        }
    }

    async fn on_frame(&self, raw: String) {
        if let Some(station) = self.station.upgrade() {
            let router = station.router().clone();
            router.handle_inbound(station, &raw).await;
        }
    }

    async fn on_disconnected(&self, reason: &str) {
        if let Some(station) = self.station.upgrade() {
            station.handle_disconnected(reason).await;
        }
    }

    async fn on_terminal_failure(&self, error: &ClientError) {
        if let Some(station) = self.station.upgrade() {
            station.handle_terminal(error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::domain::{ConnectorConfig, ConnectorType, CsmsAuth, MeterConfig, SimulationConfig};
    use crate::messagelog::MessageLog;
    use crate::ocpp::ValidationMode;
    use crate::persistence::MemoryStore;
    use crate::transport::ConnectionPool;

    fn test_station(connectors: u32) -> Arc<Station> {
        let store = MemoryStore::shared();
        let pool = ConnectionPool::shared();
        let log = MessageLog::new(store.clone());
        let router = crate::dispatch::build_router(
            pool.clone(),
            log,
            Duration::from_millis(200),
            ValidationMode::Lenient,
        );
        let config = StationConfig {
            id: "CP-1".into(),
            name: "Test".into(),
            enabled: true,
            auto_start: false,
            protocol_version: OcppVersion::V16,
            vendor: "Voltsim".into(),
            model: "EMU-1".into(),
            serial_number: None,
            firmware_version: None,
            connectors: (1..=connectors)
                .map(|id| ConnectorConfig {
                    id,
                    connector_type: ConnectorType::Type2,
                    max_power_w: 22_000.0,
                })
                .collect(),
            feature_profiles: vec!["Core".into()],
            meter: MeterConfig::default(),
            csms_url: "ws://127.0.0.1:1/ocpp".into(),
            auth: CsmsAuth::None,
            simulation: SimulationConfig::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        Station::new(
            config,
            StationDefaults::default(),
            router,
            pool,
            store,
            Broadcaster::shared(),
        )
    }

    #[tokio::test]
    async fn start_charging_rejected_when_not_operational() {
        let station = test_station(1);
        let err = station.start_charging(Some(1), None).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
        // Nothing mutated
        assert_eq!(
            station.connector_status(1).await,
            Some(ConnectorStatus::Available)
        );
    }

    #[tokio::test]
    async fn reserve_rejects_unknown_and_occupied_connectors() {
        let station = test_station(2);
        {
            let mut inner = station.inner.write().await;
            inner.runtime.lifecycle = StationLifecycle::Operational;
            if let Some(c) = inner.connectors.get_mut(&1) {
                c.status = ConnectorStatus::Charging;
                c.transaction_id = Some(7);
            }
        }

        assert!(matches!(
            station.reserve_connector(Some(9)).await,
            Err(DomainError::ConnectorNotFound(9))
        ));
        assert!(matches!(
            station.reserve_connector(Some(1)).await,
            Err(DomainError::InvalidState(_))
        ));
        // Falls through to the free connector
        assert_eq!(station.reserve_connector(None).await.unwrap(), 2);
        assert_eq!(
            station.connector_status(2).await,
            Some(ConnectorStatus::Preparing)
        );
    }

    #[tokio::test]
    async fn configuration_keys_roundtrip() {
        let station = test_station(1);

        let (all, unknown) = station.get_configuration(None).await;
        assert!(unknown.is_empty());
        assert!(all.iter().any(|k| k.key == "HeartbeatInterval"));

        assert_eq!(
            station.change_configuration("HeartbeatInterval", "30").await,
            ConfigChangeOutcome::Accepted
        );
        let (keys, _) = station
            .get_configuration(Some(vec!["HeartbeatInterval".into()]))
            .await;
        assert_eq!(keys[0].value, "30");
        assert_eq!(station.inner.read().await.heartbeat_interval, 30);

        assert_eq!(
            station.change_configuration("HeartbeatInterval", "zero").await,
            ConfigChangeOutcome::Rejected
        );
        assert_eq!(
            station.change_configuration("NumberOfConnectors", "4").await,
            ConfigChangeOutcome::Rejected
        );
        assert_eq!(
            station.change_configuration("NoSuchKey", "1").await,
            ConfigChangeOutcome::NotSupported
        );

        let (_, unknown) = station
            .get_configuration(Some(vec!["NoSuchKey".into()]))
            .await;
        assert_eq!(unknown, vec!["NoSuchKey".to_string()]);
    }

    #[tokio::test]
    async fn local_list_version_tracks_updates() {
        let station = test_station(1);
        assert_eq!(station.local_list_version(), 0);
        assert!(station.apply_local_list(7, "Full"));
        assert_eq!(station.local_list_version(), 7);
    }

    #[tokio::test]
    async fn display_messages_store_and_clear() {
        let station = test_station(1);
        assert!(!station.set_display_message(json!({"no_id": true})).await);
        assert!(station.set_display_message(json!({"id": 3, "priority": "NormalCycle"})).await);
        assert!(station.clear_display_message(3).await);
        assert!(!station.clear_display_message(3).await);
    }

    #[tokio::test]
    async fn change_availability_schedules_during_transaction() {
        let station = test_station(2);
        {
            let mut inner = station.inner.write().await;
            inner.runtime.lifecycle = StationLifecycle::Operational;
            if let Some(c) = inner.connectors.get_mut(&1) {
                c.status = ConnectorStatus::Charging;
                c.transaction_id = Some(5);
            }
        }

        // Busy connector → Scheduled, idle connector → applied
        assert_eq!(
            station.change_availability(1, false).await,
            AvailabilityOutcome::Scheduled
        );
        assert_eq!(
            station.connector_status(1).await,
            Some(ConnectorStatus::Charging)
        );
        assert_eq!(
            station.change_availability(2, false).await,
            AvailabilityOutcome::Accepted
        );
        assert_eq!(
            station.connector_status(2).await,
            Some(ConnectorStatus::Unavailable)
        );
        assert_eq!(
            station.change_availability(9, false).await,
            AvailabilityOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn meter_tick_advances_only_charging_connectors() {
        let station = test_station(2);
        {
            let mut inner = station.inner.write().await;
            if let Some(c) = inner.connectors.get_mut(&1) {
                c.status = ConnectorStatus::Charging;
                c.transaction_id = Some(1);
            }
        }
        station.meter_tick(10.0).await;

        let connectors = station.connectors().await;
        let charging = connectors.iter().find(|(id, _)| *id == 1).unwrap();
        let idle = connectors.iter().find(|(id, _)| *id == 2).unwrap();
        // 11 kW default rate for 10 s ≈ 30.6 Wh
        assert!(charging.1.meter_wh > 0.0);
        assert_eq!(idle.1.meter_wh, 0.0);
    }

    #[tokio::test]
    async fn update_config_preserves_identity() {
        let station = test_station(1);
        let mut update = station.config().await;
        let created = update.created_at;
        update.name = "Renamed".into();
        update.id = "CP-other".into();
        assert!(station.update_config(update.clone()).await.is_err());

        update.id = "CP-1".into();
        station.update_config(update).await.unwrap();
        let config = station.config().await;
        assert_eq!(config.name, "Renamed");
        assert_eq!(config.created_at, created);
        assert!(config.updated_at >= created);
    }

    #[tokio::test]
    async fn suspension_and_fault_paths() {
        let station = test_station(1);
        {
            let mut inner = station.inner.write().await;
            if let Some(c) = inner.connectors.get_mut(&1) {
                c.status = ConnectorStatus::Charging;
                c.transaction_id = Some(1);
            }
        }

        station.suspend_charging(1, true).await.unwrap();
        assert_eq!(
            station.connector_status(1).await,
            Some(ConnectorStatus::SuspendedEv)
        );
        station.resume_charging(1).await.unwrap();
        assert_eq!(
            station.connector_status(1).await,
            Some(ConnectorStatus::Charging)
        );

        // Resume is invalid while charging
        assert!(station.resume_charging(1).await.is_err());

        station.set_fault(1, true).await.unwrap();
        assert_eq!(
            station.connector_status(1).await,
            Some(ConnectorStatus::Faulted)
        );
        // Fault exits only to Available
        station.set_fault(1, false).await.unwrap();
        assert_eq!(
            station.connector_status(1).await,
            Some(ConnectorStatus::Available)
        );
    }

    #[tokio::test]
    async fn data_transfer_checks_vendor() {
        let station = test_station(1);
        let (status, _) = station.data_transfer("Voltsim", None, None).await;
        assert_eq!(status, "Accepted");
        let (status, _) = station.data_transfer("Acme", Some("x"), None).await;
        assert_eq!(status, "UnknownVendorId");
    }
}
