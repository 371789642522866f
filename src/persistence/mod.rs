//! Persistence contract and adapters
//!
//! The core consumes an abstract document store over five logical
//! collections (stations, messages, transactions, sessions, meter_values).
//! The store may be transiently unavailable; callers treat failures as
//! recoverable and keep operating on in-memory state.

pub mod memory;
pub mod traits;

use std::sync::Arc;

pub use memory::MemoryStore;
pub use traits::{EmulatorStore, MessageStats};

/// Shared, reference-counted store handle
pub type SharedStore = Arc<dyn EmulatorStore>;
