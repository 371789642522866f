//! Scenario engine: scripted step sequences driven against running stations

pub mod builtin;
pub mod runner;

pub use builtin::builtin_scenarios;
pub use runner::{ScenarioRunner, SharedScenarioRunner};
