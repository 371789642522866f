//! Outbound WebSocket transport
//!
//! One [`WsClient`] per emulated station dials the CSMS, negotiates the OCPP
//! subprotocol, and runs a read/write pump pair with keepalive and
//! exponential-backoff reconnection. The [`ConnectionPool`] owns all clients
//! keyed by station id.

pub mod client;
pub mod pool;
pub mod tls;

pub use client::{
    BackoffPolicy, ClientError, ClientEvents, ClientState, ClientStatsSnapshot, WsClient,
    WsClientConfig,
};
pub use pool::{ConnectionPool, PoolStats, SharedConnectionPool};
pub use tls::TlsSettings;
