//! Scenario and execution models
//!
//! A scenario is an ordered list of steps driven against one station; an
//! execution is one run of a scenario with per-step results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{DomainError, DomainResult};

/// Step vocabulary understood by the scenario runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ApiCall,
    WaitForMessage,
    WaitForState,
    Delay,
    WaitCondition,
    SendMessage,
    Assert,
}

/// One scripted step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    pub step_type: StepType,
    /// Optional label, the target of `on_success` / `on_failure` jumps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Per-step timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Field-equality checks applied to the payload of an awaited message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
}

impl ScenarioStep {
    pub fn new(step_type: StepType) -> Self {
        Self {
            step_type,
            label: None,
            params: Map::new(),
            timeout_ms: None,
            validation: None,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }
}

/// A scripted, ordered sequence of operations and observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Station driven when a step names none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_station_id: Option<String>,
    pub steps: Vec<ScenarioStep>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_builtin: bool,
}

impl Scenario {
    /// Validate the definition at the load boundary.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidScenario("scenario name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(DomainError::InvalidScenario("scenario has no steps".into()));
        }
        let labels: Vec<&str> = self
            .steps
            .iter()
            .filter_map(|s| s.label.as_deref())
            .collect();
        for (idx, step) in self.steps.iter().enumerate() {
            for target in [step.on_success.as_deref(), step.on_failure.as_deref()]
                .into_iter()
                .flatten()
            {
                if !labels.contains(&target) {
                    return Err(DomainError::InvalidScenario(format!(
                        "step {} jumps to unknown label '{}'",
                        idx, target
                    )));
                }
            }
            if step.step_type == StepType::Delay && step.param_u64("duration").is_none() {
                return Err(DomainError::InvalidScenario(format!(
                    "delay step {} is missing 'duration'",
                    idx
                )));
            }
        }
        Ok(())
    }

    /// Index of the step carrying `label`.
    pub fn step_index(&self, label: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.label.as_deref() == Some(label))
    }
}

// ── Execution ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// Result of one step within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Captured output (e.g. the matched message, the asserted values)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn pending(index: usize) -> Self {
        Self {
            index,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
        }
    }
}

/// One run of a scenario against a station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    /// Snapshot of the scenario as executed
    pub scenario: Scenario,
    pub station_id: String,
    pub status: ExecutionStatus,
    pub current_step: usize,
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(scenario: Scenario, station_id: impl Into<String>) -> Self {
        let step_results = (0..scenario.steps.len()).map(StepResult::pending).collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scenario,
            station_id: station_id.into(),
            status: ExecutionStatus::Pending,
            current_step: 0,
            step_results,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Progress event published to the broadcaster on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioProgress {
    pub execution_id: String,
    pub scenario_name: String,
    pub station_id: String,
    pub status: ExecutionStatus,
    pub current_step: usize,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(steps: Vec<ScenarioStep>) -> Scenario {
        Scenario {
            id: "s1".into(),
            name: "test".into(),
            description: String::new(),
            default_station_id: Some("CP-1".into()),
            steps,
            tags: vec![],
            is_builtin: false,
        }
    }

    #[test]
    fn empty_scenario_rejected() {
        assert!(scenario(vec![]).validate().is_err());
    }

    #[test]
    fn unknown_jump_label_rejected() {
        let mut step = ScenarioStep::new(StepType::Delay).with_param("duration", 100);
        step.on_failure = Some("nowhere".into());
        assert!(scenario(vec![step]).validate().is_err());
    }

    #[test]
    fn jump_to_existing_label_accepted() {
        let mut first = ScenarioStep::new(StepType::Delay).with_param("duration", 100);
        first.on_failure = Some("end".into());
        let mut last = ScenarioStep::new(StepType::Delay).with_param("duration", 100);
        last.label = Some("end".into());
        let s = scenario(vec![first, last]);
        assert!(s.validate().is_ok());
        assert_eq!(s.step_index("end"), Some(1));
    }

    #[test]
    fn delay_without_duration_rejected() {
        assert!(scenario(vec![ScenarioStep::new(StepType::Delay)])
            .validate()
            .is_err());
    }

    #[test]
    fn execution_starts_pending() {
        let s = scenario(vec![ScenarioStep::new(StepType::Delay).with_param("duration", 1)]);
        let exec = Execution::new(s, "CP-1");
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.step_results.len(), 1);
        assert_eq!(exec.step_results[0].status, StepStatus::Pending);
    }
}
