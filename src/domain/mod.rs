//! Core domain entities and value objects

pub mod error;
pub mod message;
pub mod scenario;
pub mod station;
pub mod transaction;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use message::{Direction, MessageEntry, MessageFilter, MessageType};
pub use scenario::{
    Execution, ExecutionStatus, Scenario, ScenarioProgress, ScenarioStep, StepResult, StepStatus,
    StepType,
};
pub use station::{
    ConnectorConfig, ConnectorRuntime, ConnectorStatus, ConnectorType, CsmsAuth, MeterConfig,
    SessionRecord, SimulationConfig, StationConfig, StationLifecycle, StationRuntime,
    StationSnapshot,
};
pub use transaction::{MeterSample, Transaction, TransactionStatus};
pub use version::OcppVersion;
