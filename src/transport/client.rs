//! Per-station outbound WebSocket client
//!
//! One instance per emulated station. The client dials the CSMS, advertises
//! exactly one OCPP subprotocol, then runs two cooperating tasks per
//! connection: a read pump that dispatches incoming frames and polices the
//! pong deadline, and a write pump that drains the bounded send queue and
//! emits keepalive pings. Connection loss triggers exponential-backoff
//! reconnection until the attempt budget is exhausted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::domain::{CsmsAuth, OcppVersion};
use crate::shared::shutdown::{ShutdownSignal, ShutdownWatch};

use super::tls::{build_connector, TlsSettings};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Connect failed: {0}")]
    ConnectError(String),
    #[error("Subprotocol rejected: expected '{expected}', server selected {got:?}")]
    SubprotocolRejected {
        expected: &'static str,
        got: Option<String>,
    },
    #[error("Not connected")]
    NotConnected,
    #[error("Send queue full")]
    QueueFull,
    #[error("Client closed")]
    Closed,
    #[error("Reconnect attempts exhausted after {0} failures")]
    ReconnectExhausted(u32),
    #[error("TLS error: {0}")]
    Tls(String),
}

// ── Configuration ──────────────────────────────────────────────

/// Reconnect backoff: `min(initial · 2^(n−1), cap)` after the n-th
/// consecutive failure, reset on any successful connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub cap: Duration,
    /// Consecutive failures tolerated before the client terminates
    /// (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            cap: Duration::from_secs(60),
            max_attempts: 0,
        }
    }
}

impl BackoffPolicy {
    /// Delay applied after the n-th consecutive failure (n ≥ 1).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        let delay = self.initial.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub station_id: String,
    /// Full WebSocket URL including the station path segment
    pub url: String,
    pub version: OcppVersion,
    pub auth: CsmsAuth,
    pub tls: TlsSettings,
    /// Bounded send queue capacity
    pub queue_capacity: usize,
    /// WebSocket ping cadence
    pub ping_interval: Duration,
    /// Read deadline armed at connect and extended on every pong
    pub pong_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl WsClientConfig {
    pub fn new(station_id: impl Into<String>, url: impl Into<String>, version: OcppVersion) -> Self {
        Self {
            station_id: station_id.into(),
            url: url.into(),
            version,
            auth: CsmsAuth::None,
            tls: TlsSettings::default(),
            queue_capacity: 100,
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

// ── State ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Closed,
}

/// Callbacks surfaced to the owning station driver.
///
/// `on_frame` runs on the read pump; implementations must stay prompt and
/// spawn any station-initiated request/response conversation, otherwise the
/// matching CallResult can never be read.
#[async_trait]
pub trait ClientEvents: Send + Sync {
    async fn on_connected(&self) {}
    async fn on_frame(&self, _raw: String) {}
    async fn on_disconnected(&self, _reason: &str) {}
    async fn on_terminal_failure(&self, _error: &ClientError) {}
}

/// No-op event sink.
pub struct NoopEvents;

#[async_trait]
impl ClientEvents for NoopEvents {}

// ── Stats ──────────────────────────────────────────────────────

#[derive(Default)]
struct ClientStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    reconnect_failures: AtomicU64,
    queue_dropped: AtomicU64,
    connected_at: std::sync::RwLock<Option<DateTime<Utc>>>,
    last_message_at: std::sync::RwLock<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatsSnapshot {
    pub station_id: String,
    pub state: ClientState,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub reconnect_failures: u64,
    pub queue_dropped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

// ── Client ─────────────────────────────────────────────────────

enum SessionEnd {
    ServerClose,
    StreamEnded,
    ReadError(String),
    WriteError,
    PongTimeout,
    Closed,
}

impl SessionEnd {
    fn describe(&self) -> &str {
        match self {
            Self::ServerClose => "server closed the connection",
            Self::StreamEnded => "stream ended",
            Self::ReadError(e) => e,
            Self::WriteError => "write error",
            Self::PongTimeout => "pong timeout",
            Self::Closed => "client closed",
        }
    }
}

enum ConnectFailure {
    Retryable(String),
    Fatal(ClientError),
}

/// Outbound WebSocket client for one station.
pub struct WsClient {
    config: WsClientConfig,
    state: std::sync::RwLock<ClientState>,
    send_tx: mpsc::Sender<String>,
    send_rx: Mutex<Option<mpsc::Receiver<String>>>,
    stats: ClientStats,
    close_signal: ShutdownSignal,
    events: Arc<dyn ClientEvents>,
}

impl WsClient {
    pub fn new(config: WsClientConfig, events: Arc<dyn ClientEvents>) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            config,
            state: std::sync::RwLock::new(ClientState::Disconnected),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            stats: ClientStats::default(),
            close_signal: ShutdownSignal::new(),
            events,
        })
    }

    pub fn station_id(&self) -> &str {
        &self.config.station_id
    }

    pub fn state(&self) -> ClientState {
        *self.state.read().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    fn set_state(&self, state: ClientState) {
        let mut guard = self.state.write().unwrap();
        if *guard != state {
            debug!(
                station_id = self.config.station_id.as_str(),
                from = ?*guard,
                to = ?state,
                "Client state change"
            );
            *guard = state;
        }
    }

    /// Start the connection supervisor. Idempotent; returns `Closed` once
    /// the client has been closed.
    pub fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.close_signal.is_triggered() {
            return Err(ClientError::Closed);
        }
        let this = self.clone();
        tokio::spawn(async move {
            let rx = this.send_rx.lock().await.take();
            if let Some(rx) = rx {
                this.run(rx).await;
            }
        });
        Ok(())
    }

    /// Enqueue a frame for transmission.
    pub fn send(&self, text: String) -> Result<(), ClientError> {
        if self.state() != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.send_tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.stats.queue_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ocpp_send_queue_dropped_total").increment(1);
                ClientError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
        })
    }

    /// Clean close: the supervisor exits and never reconnects. Idempotent.
    pub fn close(&self) {
        if self.state() == ClientState::Disconnected {
            self.set_state(ClientState::Closed);
        }
        self.close_signal.trigger();
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            station_id: self.config.station_id.clone(),
            state: self.state(),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            pings_sent: self.stats.pings_sent.load(Ordering::Relaxed),
            pongs_received: self.stats.pongs_received.load(Ordering::Relaxed),
            reconnect_failures: self.stats.reconnect_failures.load(Ordering::Relaxed),
            queue_dropped: self.stats.queue_dropped.load(Ordering::Relaxed),
            connected_at: *self.stats.connected_at.read().unwrap(),
            last_message_at: *self.stats.last_message_at.read().unwrap(),
        }
    }

    // ── Supervisor ─────────────────────────────────────────

    async fn run(self: Arc<Self>, rx: mpsc::Receiver<String>) {
        let mut rx_slot = Some(rx);
        let mut failures: u32 = 0;
        let mut close_watch = self.close_signal.watcher();

        loop {
            if self.close_signal.is_triggered() {
                break;
            }
            self.set_state(ClientState::Connecting);

            match self.establish().await {
                Ok(ws) => {
                    failures = 0;
                    *self.stats.connected_at.write().unwrap() = Some(Utc::now());
                    self.set_state(ClientState::Connected);
                    info!(
                        station_id = self.config.station_id.as_str(),
                        url = self.config.url.as_str(),
                        subprotocol = self.config.version.subprotocol(),
                        "Connected to CSMS"
                    );
                    self.events.on_connected().await;

                    let rx = match rx_slot.take() {
                        Some(rx) => rx,
                        None => break,
                    };
                    let (rx_back, end) = match self.run_session(ws, rx, &mut close_watch).await {
                        Some(pair) => pair,
                        None => {
                            self.set_state(ClientState::Error);
                            return;
                        }
                    };
                    rx_slot = Some(rx_back);

                    info!(
                        station_id = self.config.station_id.as_str(),
                        reason = end.describe(),
                        "Disconnected from CSMS"
                    );
                    self.events.on_disconnected(end.describe()).await;

                    if matches!(end, SessionEnd::Closed) || self.close_signal.is_triggered() {
                        break;
                    }
                    self.set_state(ClientState::Reconnecting);
                }
                Err(ConnectFailure::Fatal(e)) => {
                    error!(
                        station_id = self.config.station_id.as_str(),
                        error = %e,
                        "Fatal handshake failure"
                    );
                    self.set_state(ClientState::Error);
                    self.events.on_terminal_failure(&e).await;
                    return;
                }
                Err(ConnectFailure::Retryable(msg)) => {
                    warn!(
                        station_id = self.config.station_id.as_str(),
                        error = msg.as_str(),
                        "Connect attempt failed"
                    );
                }
            }

            failures += 1;
            self.stats.reconnect_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("ocpp_ws_reconnects_total").increment(1);

            let max = self.config.backoff.max_attempts;
            if max > 0 && failures >= max {
                let err = ClientError::ReconnectExhausted(failures);
                error!(
                    station_id = self.config.station_id.as_str(),
                    failures, "Reconnect attempts exhausted"
                );
                self.set_state(ClientState::Error);
                self.events.on_terminal_failure(&err).await;
                return;
            }

            let delay = self.config.backoff.delay_for(failures);
            debug!(
                station_id = self.config.station_id.as_str(),
                failures,
                delay_ms = delay.as_millis() as u64,
                "Backing off before reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = close_watch.stopped() => break,
            }
        }

        self.set_state(ClientState::Closed);
    }

    async fn establish(&self) -> Result<WsStream, ConnectFailure> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| {
                ConnectFailure::Fatal(ClientError::ConnectError(format!("bad URL: {}", e)))
            })?;

        let expected = self.config.version.subprotocol();
        let headers = request.headers_mut();
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(expected),
        );
        match &self.config.auth {
            CsmsAuth::None => {}
            CsmsAuth::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                let value = HeaderValue::from_str(&format!("Basic {}", encoded)).map_err(|e| {
                    ConnectFailure::Fatal(ClientError::ConnectError(format!(
                        "bad basic credentials: {}",
                        e
                    )))
                })?;
                headers.insert(AUTHORIZATION, value);
            }
            CsmsAuth::Bearer { token } => {
                let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
                    ConnectFailure::Fatal(ClientError::ConnectError(format!("bad token: {}", e)))
                })?;
                headers.insert(AUTHORIZATION, value);
            }
        }

        let connector = build_connector(&self.config.tls).map_err(ConnectFailure::Fatal)?;

        let connect = connect_async_tls_with_config(request, None, false, connector);
        let (ws, response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| ConnectFailure::Retryable("connect timeout".to_string()))?
            .map_err(|e| ConnectFailure::Retryable(e.to_string()))?;

        // The subprotocol the server selected is the source of truth for the
        // protocol version; anything but ours is a fatal handshake failure.
        let selected = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if selected.as_deref() != Some(expected) {
            return Err(ConnectFailure::Fatal(ClientError::SubprotocolRejected {
                expected,
                got: selected,
            }));
        }

        Ok(ws)
    }

    // ── Session (read pump + write pump) ───────────────────

    async fn run_session(
        self: &Arc<Self>,
        ws: WsStream,
        rx: mpsc::Receiver<String>,
        close_watch: &mut ShutdownWatch,
    ) -> Option<(mpsc::Receiver<String>, SessionEnd)> {
        let (sink, stream) = ws.split();
        let session_stop = ShutdownSignal::new();

        let write_handle = tokio::spawn({
            let this = self.clone();
            let stop = session_stop.clone();
            async move { this.write_pump(sink, rx, stop).await }
        });

        let end = self.read_pump(stream, &session_stop, close_watch).await;

        session_stop.trigger();
        match write_handle.await {
            Ok(rx) => Some((rx, end)),
            Err(e) => {
                error!(
                    station_id = self.config.station_id.as_str(),
                    error = %e,
                    "Write pump task failed"
                );
                None
            }
        }
    }

    async fn read_pump(
        &self,
        mut stream: WsSource,
        session_stop: &ShutdownSignal,
        close_watch: &mut ShutdownWatch,
    ) -> SessionEnd {
        let mut stop_watch = session_stop.watcher();
        let mut deadline = Instant::now() + self.config.pong_timeout;

        loop {
            tokio::select! {
                maybe = stream.next() => match maybe {
                    Some(Ok(Message::Text(text))) => {
                        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        *self.stats.last_message_at.write().unwrap() = Some(Utc::now());
                        metrics::counter!("ocpp_messages_total", "direction" => "received")
                            .increment(1);
                        self.events.on_frame(text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        self.stats.pongs_received.fetch_add(1, Ordering::Relaxed);
                        deadline = Instant::now() + self.config.pong_timeout;
                    }
                    // tungstenite answers pings internally
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) => return SessionEnd::ServerClose,
                    Some(Ok(Message::Binary(data))) => {
                        warn!(
                            station_id = self.config.station_id.as_str(),
                            bytes = data.len(),
                            "Ignoring binary frame"
                        );
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return SessionEnd::ReadError(e.to_string()),
                    None => return SessionEnd::StreamEnded,
                },
                _ = sleep_until(deadline) => return SessionEnd::PongTimeout,
                _ = stop_watch.stopped() => return SessionEnd::WriteError,
                _ = close_watch.stopped() => return SessionEnd::Closed,
            }
        }
    }

    async fn write_pump(
        self: Arc<Self>,
        mut sink: WsSink,
        mut rx: mpsc::Receiver<String>,
        stop: ShutdownSignal,
    ) -> mpsc::Receiver<String> {
        let mut stop_watch = stop.watcher();
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(
                                station_id = self.config.station_id.as_str(),
                                error = %e,
                                "Write failed"
                            );
                            break;
                        }
                        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("ocpp_messages_total", "direction" => "sent")
                            .increment(1);
                    }
                    // Sender dropped with the client
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                    self.stats.pings_sent.fetch_add(1, Ordering::Relaxed);
                }
                _ = stop_watch.stopped() => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }

        stop.trigger();
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{
        Request as HsRequest, Response as HsResponse,
    };

    // ── Backoff policy (pure) ──────────────────────────────

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(8),
            max_attempts: 5,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        // capped
        assert_eq!(policy.delay_for(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for(12), Duration::from_secs(8));
    }

    // ── Test CSMS stub ─────────────────────────────────────

    struct StubOptions {
        echo_subprotocol: bool,
    }

    /// Accept one connection, optionally echo the subprotocol, forward
    /// every text frame into the channel.
    async fn spawn_stub(options: StubOptions) -> (std::net::SocketAddr, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_hdr_async(stream, |req: &HsRequest, mut resp: HsResponse| {
                if options.echo_subprotocol {
                    if let Some(proto) = req.headers().get("Sec-WebSocket-Protocol") {
                        resp.headers_mut()
                            .insert("Sec-WebSocket-Protocol", proto.clone());
                    }
                }
                Ok(resp)
            })
            .await
            .unwrap();

            let (_sink, mut source) = ws.split();
            while let Some(Ok(msg)) = source.next().await {
                if let Message::Text(text) = msg {
                    let _ = seen_tx.send(text);
                }
            }
        });

        (addr, seen_rx)
    }

    fn test_config(addr: std::net::SocketAddr) -> WsClientConfig {
        let mut config = WsClientConfig::new(
            "CP-1",
            format!("ws://{}/ocpp/CP-1", addr),
            OcppVersion::V16,
        );
        config.backoff = BackoffPolicy {
            initial: Duration::from_millis(10),
            cap: Duration::from_millis(40),
            max_attempts: 3,
        };
        config.connect_timeout = Duration::from_secs(2);
        config
    }

    async fn wait_for(mut predicate: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !predicate() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[derive(Default)]
    struct RecordingEvents {
        terminal: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl ClientEvents for RecordingEvents {
        async fn on_terminal_failure(&self, error: &ClientError) {
            *self.terminal.lock().unwrap() = Some(error.to_string());
        }
    }

    #[tokio::test]
    async fn connects_negotiates_and_sends_in_order() {
        let (addr, mut seen) = spawn_stub(StubOptions {
            echo_subprotocol: true,
        })
        .await;

        let client = WsClient::new(test_config(addr), Arc::new(NoopEvents));
        client.connect().unwrap();
        wait_for(|| client.is_connected()).await;

        for i in 0..5 {
            client.send(format!("[2,\"u{}\",\"Heartbeat\",{{}}]", i)).unwrap();
        }
        for i in 0..5 {
            let frame = tokio::time::timeout(Duration::from_secs(5), seen.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(frame.contains(&format!("u{}", i)), "out of order: {}", frame);
        }

        assert!(client.stats().messages_sent >= 5);
        client.close();
        wait_for(|| client.state() == ClientState::Closed).await;
    }

    #[tokio::test]
    async fn subprotocol_mismatch_is_fatal() {
        let (addr, _seen) = spawn_stub(StubOptions {
            echo_subprotocol: false,
        })
        .await;

        let events = Arc::new(RecordingEvents::default());
        let client = WsClient::new(test_config(addr), events.clone());
        client.connect().unwrap();

        wait_for(|| client.state() == ClientState::Error).await;
        let message = events.terminal.lock().unwrap().clone().unwrap();
        assert!(message.contains("Subprotocol"));
    }

    #[tokio::test]
    async fn refused_connection_exhausts_attempts() {
        // Bind then drop to obtain a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let events = Arc::new(RecordingEvents::default());
        let client = WsClient::new(test_config(addr), events.clone());
        client.connect().unwrap();

        wait_for(|| client.state() == ClientState::Error).await;
        assert_eq!(client.stats().reconnect_failures, 3);
        let message = events.terminal.lock().unwrap().clone().unwrap();
        assert!(message.contains("exhausted"));
    }

    #[tokio::test]
    async fn send_when_disconnected_is_rejected() {
        let config = WsClientConfig::new("CP-1", "ws://127.0.0.1:1/ocpp/CP-1", OcppVersion::V16);
        let client = WsClient::new(config, Arc::new(NoopEvents));
        assert!(matches!(
            client.send("[2,\"u\",\"Heartbeat\",{}]".to_string()),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let config = WsClientConfig::new("CP-1", "ws://127.0.0.1:1/ocpp/CP-1", OcppVersion::V16);
        let client = WsClient::new(config, Arc::new(NoopEvents));
        client.close();
        client.close();
        assert_eq!(client.state(), ClientState::Closed);
        assert!(matches!(client.connect(), Err(ClientError::Closed)));
    }
}
