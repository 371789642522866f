//! Station simulation: per-station drivers, state machines, and the manager

pub mod manager;
pub mod meter;
pub mod state;
mod station;

pub use manager::{ManagerStats, SharedStationManager, StationManager};
pub use station::{
    AvailabilityOutcome, ConfigChangeOutcome, ConfigurationKey, Station, StationDefaults,
    UnlockOutcome,
};
