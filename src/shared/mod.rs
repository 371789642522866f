pub mod shutdown;

pub use shutdown::{DrainPhase, ShutdownCoordinator, ShutdownSignal, ShutdownWatch};
