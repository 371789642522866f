//! Domain errors

use thiserror::Error;

/// Domain-level error types
#[derive(Debug, Clone, Error)]
pub enum DomainError {
    /// Station not found in the registry
    #[error("Station not found: {0}")]
    StationNotFound(String),
    /// Station id already registered
    #[error("Station already exists: {0}")]
    StationAlreadyExists(String),
    /// Connector not found on the station
    #[error("Connector not found: {0}")]
    ConnectorNotFound(u32),
    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(i64),
    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Configuration rejected at the boundary
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Scenario or step definition rejected at the boundary
    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),
    /// Scenario or execution not found
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),
    /// Storage/persistence error (recoverable; in-memory state stays authoritative)
    #[error("Storage error: {0}")]
    Storage(String),
    /// Transport-level failure surfaced to the caller
    #[error("Transport error: {0}")]
    Transport(String),
    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type for domain operations
pub type DomainResult<T> = Result<T, DomainError>;
