//! # Voltsim OCPP
//!
//! Emulates a fleet of EV charging stations speaking OCPP-J (1.6 / 2.0.1 / 2.1)
//! over outbound WebSocket connections to a CSMS, and replays scripted
//! scenarios against the running fleet for integration testing.
//!
//! ## Architecture
//!
//! - **shared**: Cross-cutting utilities (shutdown coordination)
//! - **domain**: Core entities and value objects (stations, transactions, messages, scenarios)
//! - **ocpp**: OCPP-J framing, call-error codes, per-action payload validation
//! - **transport**: Per-station outbound WebSocket client and the connection pool
//! - **dispatch**: Version-aware message routing and pending-request correlation
//! - **station**: Station/connector state machines, meter synthesis, the station manager
//! - **messagelog**: Buffered, batched persistence of wire traffic with live listeners
//! - **broadcast**: UI subscriber fan-out with per-client bounded queues
//! - **scenario**: Step-interpreting scenario execution engine
//! - **persistence**: Document-store contract consumed by the core + in-memory adapter
//! - **config**: Application configuration (TOML-based)

pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod messagelog;
pub mod ocpp;
pub mod persistence;
pub mod scenario;
pub mod shared;
pub mod station;
pub mod transport;

// Re-export commonly used types at crate root
pub use broadcast::{Broadcaster, SharedBroadcaster};
pub use config::{default_config_path, AppConfig};
pub use dispatch::{build_router, MessageRouter, SharedMessageRouter};
pub use domain::{DomainError, DomainResult, OcppVersion};
pub use messagelog::{MessageLog, SharedMessageLog};
pub use persistence::{MemoryStore, SharedStore};
pub use scenario::{ScenarioRunner, SharedScenarioRunner};
pub use station::{StationManager, SharedStationManager};
pub use transport::{ConnectionPool, SharedConnectionPool};
