//! Scenario execution engine
//!
//! Interprets the step vocabulary against the station manager (control),
//! the message log (observation), and clocks. Execution is sequential
//! within one run; every step is individually time-bounded. Pause is
//! honored at step boundaries; cancel unblocks a paused executor and
//! terminates the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::broadcast::SharedBroadcaster;
use crate::domain::{
    Direction, DomainError, DomainResult, Execution, ExecutionStatus, MessageEntry, Scenario,
    ScenarioProgress, ScenarioStep, StepStatus, StepType,
};
use crate::messagelog::SharedMessageLog;
use crate::ocpp::OcppFrame;
use crate::station::SharedStationManager;

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ExecutionHandle {
    state: Mutex<Execution>,
    pause: watch::Sender<bool>,
    cancel: crate::shared::shutdown::ShutdownSignal,
}

/// Execution engine over the scenario step vocabulary.
pub struct ScenarioRunner {
    manager: SharedStationManager,
    log: SharedMessageLog,
    broadcaster: SharedBroadcaster,
    scenarios: DashMap<String, Scenario>,
    executions: DashMap<String, Arc<ExecutionHandle>>,
}

pub type SharedScenarioRunner = Arc<ScenarioRunner>;

impl ScenarioRunner {
    pub fn new(
        manager: SharedStationManager,
        log: SharedMessageLog,
        broadcaster: SharedBroadcaster,
    ) -> SharedScenarioRunner {
        let runner = Arc::new(Self {
            manager,
            log,
            broadcaster,
            scenarios: DashMap::new(),
            executions: DashMap::new(),
        });
        for scenario in super::builtin::builtin_scenarios() {
            runner.scenarios.insert(scenario.id.clone(), scenario);
        }
        runner
    }

    // ── Scenario CRUD ──────────────────────────────────────

    pub fn add_scenario(&self, mut scenario: Scenario) -> DomainResult<String> {
        if scenario.id.is_empty() {
            scenario.id = uuid::Uuid::new_v4().to_string();
        }
        scenario.is_builtin = false;
        scenario.validate()?;
        let id = scenario.id.clone();
        self.scenarios.insert(id.clone(), scenario);
        Ok(id)
    }

    pub fn get_scenario(&self, id: &str) -> Option<Scenario> {
        self.scenarios.get(id).map(|s| s.clone())
    }

    pub fn list_scenarios(&self) -> Vec<Scenario> {
        self.scenarios.iter().map(|s| s.clone()).collect()
    }

    pub fn remove_scenario(&self, id: &str) -> DomainResult<()> {
        // The read guard must drop before remove touches the same shard
        let is_builtin = match self.scenarios.get(id) {
            Some(scenario) => scenario.is_builtin,
            None => {
                return Err(DomainError::InvalidScenario(format!(
                    "unknown scenario '{}'",
                    id
                )))
            }
        };
        if is_builtin {
            return Err(DomainError::InvalidScenario(
                "builtin scenarios cannot be removed".into(),
            ));
        }
        self.scenarios.remove(id);
        Ok(())
    }

    // ── Execution control ──────────────────────────────────

    /// Start a stored scenario; returns the execution id.
    pub fn execute_by_id(
        self: &Arc<Self>,
        scenario_id: &str,
        station_id: Option<String>,
    ) -> DomainResult<String> {
        let scenario = self
            .get_scenario(scenario_id)
            .ok_or_else(|| DomainError::InvalidScenario(format!("unknown scenario '{}'", scenario_id)))?;
        self.execute(scenario, station_id)
    }

    /// Start an execution of the given scenario snapshot.
    pub fn execute(
        self: &Arc<Self>,
        scenario: Scenario,
        station_id: Option<String>,
    ) -> DomainResult<String> {
        scenario.validate()?;
        let station_id = station_id
            .or_else(|| scenario.default_station_id.clone())
            .ok_or_else(|| {
                DomainError::InvalidScenario("no station id for execution".into())
            })?;

        let execution = Execution::new(scenario, station_id);
        let execution_id = execution.id.clone();
        let (pause, _) = watch::channel(false);
        let handle = Arc::new(ExecutionHandle {
            state: Mutex::new(execution),
            pause,
            cancel: crate::shared::shutdown::ShutdownSignal::new(),
        });
        self.executions.insert(execution_id.clone(), handle.clone());

        let runner = self.clone();
        tokio::spawn(async move {
            runner.run(handle).await;
        });
        Ok(execution_id)
    }

    /// Pause at the next step boundary.
    pub async fn pause(&self, execution_id: &str) -> DomainResult<()> {
        let handle = self.handle(execution_id)?;
        {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                return Err(DomainError::InvalidState("execution already finished".into()));
            }
            state.status = ExecutionStatus::Paused;
        }
        let _ = handle.pause.send(true);
        self.publish(&handle, None).await;
        Ok(())
    }

    pub async fn resume(&self, execution_id: &str) -> DomainResult<()> {
        let handle = self.handle(execution_id)?;
        {
            let mut state = handle.state.lock().await;
            if state.status != ExecutionStatus::Paused {
                return Err(DomainError::InvalidState("execution is not paused".into()));
            }
            state.status = ExecutionStatus::Running;
        }
        let _ = handle.pause.send(false);
        self.publish(&handle, None).await;
        Ok(())
    }

    /// Cancel, also unblocking a paused executor.
    pub async fn cancel(&self, execution_id: &str) -> DomainResult<()> {
        let handle = self.handle(execution_id)?;
        handle.cancel.trigger();
        Ok(())
    }

    pub async fn get_execution(&self, execution_id: &str) -> Option<Execution> {
        // Clone the handle out so no map guard is held across the await
        let handle = self
            .executions
            .get(execution_id)
            .map(|entry| entry.value().clone());
        match handle {
            Some(handle) => {
                let state = handle.state.lock().await;
                Some(state.clone())
            }
            None => None,
        }
    }

    pub async fn list_executions(&self) -> Vec<Execution> {
        let handles: Vec<Arc<ExecutionHandle>> =
            self.executions.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.state.lock().await.clone());
        }
        out
    }

    fn handle(&self, execution_id: &str) -> DomainResult<Arc<ExecutionHandle>> {
        self.executions
            .get(execution_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| DomainError::ExecutionNotFound(execution_id.to_string()))
    }

    // ── Executor ───────────────────────────────────────────

    async fn run(self: Arc<Self>, handle: Arc<ExecutionHandle>) {
        let (scenario, station_id, execution_id) = {
            let mut state = handle.state.lock().await;
            // A pause landing before the executor task is scheduled must
            // survive startup
            if state.status == ExecutionStatus::Pending {
                state.status = ExecutionStatus::Running;
            }
            state.started_at = Utc::now();
            (
                state.scenario.clone(),
                state.station_id.clone(),
                state.id.clone(),
            )
        };
        info!(
            execution_id = execution_id.as_str(),
            scenario = scenario.name.as_str(),
            station_id = station_id.as_str(),
            "Scenario execution started"
        );
        self.publish(&handle, None).await;

        // Observe the station's wire traffic for wait_for_message
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<MessageEntry>();
        let filter_station = station_id.clone();
        let listener_id = self.log.add_listener(Arc::new(move |entry| {
            if entry.station_id == filter_station {
                let _ = msg_tx.send(entry.clone());
            }
        }));

        let mut cancel_watch = handle.cancel.watcher();
        let total = scenario.steps.len();
        let mut index = 0usize;
        let mut final_status = ExecutionStatus::Completed;
        let mut final_error: Option<String> = None;

        while index < total {
            // Pause is honored at the step boundary
            if !self.wait_if_paused(&handle).await {
                final_status = ExecutionStatus::Cancelled;
                break;
            }
            if handle.cancel.is_triggered() {
                final_status = ExecutionStatus::Cancelled;
                break;
            }

            let step = scenario.steps[index].clone();
            {
                let mut state = handle.state.lock().await;
                state.current_step = index;
                state.step_results[index].status = StepStatus::Running;
                state.step_results[index].started_at = Some(Utc::now());
            }
            self.publish(&handle, Some(StepStatus::Running)).await;

            let timeout = step
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STEP_TIMEOUT);
            // Delay steps fail on cancellation only, never on timeout
            let bounded = step.step_type != StepType::Delay;

            let step_future = self.run_step(&step, &station_id, &mut msg_rx);
            tokio::pin!(step_future);
            let outcome: Option<Result<Value, String>> = tokio::select! {
                result = &mut step_future => Some(result),
                _ = cancel_watch.stopped() => None,
                _ = tokio::time::sleep(timeout), if bounded => {
                    Some(Err(format!("step timed out after {}ms", timeout.as_millis())))
                }
            };

            let result = match outcome {
                Some(result) => result,
                None => {
                    let mut state = handle.state.lock().await;
                    state.step_results[index].status = StepStatus::Skipped;
                    state.step_results[index].ended_at = Some(Utc::now());
                    final_status = ExecutionStatus::Cancelled;
                    break;
                }
            };

            match result {
                Ok(output) => {
                    {
                        let mut state = handle.state.lock().await;
                        state.step_results[index].status = StepStatus::Success;
                        state.step_results[index].ended_at = Some(Utc::now());
                        state.step_results[index].output = Some(output);
                    }
                    metrics::counter!("ocpp_scenario_steps_total", "status" => "success")
                        .increment(1);
                    self.publish(&handle, Some(StepStatus::Success)).await;
                    index = match step
                        .on_success
                        .as_deref()
                        .and_then(|label| scenario.step_index(label))
                    {
                        Some(target) => target,
                        None => index + 1,
                    };
                }
                Err(error) => {
                    {
                        let mut state = handle.state.lock().await;
                        state.step_results[index].status = StepStatus::Failed;
                        state.step_results[index].ended_at = Some(Utc::now());
                        state.step_results[index].error = Some(error.clone());
                    }
                    metrics::counter!("ocpp_scenario_steps_total", "status" => "failed")
                        .increment(1);
                    self.publish(&handle, Some(StepStatus::Failed)).await;
                    match step
                        .on_failure
                        .as_deref()
                        .and_then(|label| scenario.step_index(label))
                    {
                        Some(target) => index = target,
                        None => {
                            final_status = ExecutionStatus::Failed;
                            final_error = Some(error);
                            break;
                        }
                    }
                }
            }
        }

        self.log.remove_listener(listener_id);
        {
            let mut state = handle.state.lock().await;
            state.status = final_status;
            state.error = final_error;
            state.completed_at = Some(Utc::now());
        }
        self.publish(&handle, None).await;
        info!(
            execution_id = execution_id.as_str(),
            status = ?final_status,
            "Scenario execution finished"
        );
    }

    /// Block while paused. Returns `false` when cancelled.
    async fn wait_if_paused(&self, handle: &Arc<ExecutionHandle>) -> bool {
        let mut pause_rx = handle.pause.subscribe();
        let mut cancel_watch = handle.cancel.watcher();
        loop {
            if !*pause_rx.borrow() {
                return true;
            }
            tokio::select! {
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = cancel_watch.stopped() => return false,
            }
        }
    }

    async fn publish(&self, handle: &Arc<ExecutionHandle>, step_status: Option<StepStatus>) {
        let progress = {
            let state = handle.state.lock().await;
            ScenarioProgress {
                execution_id: state.id.clone(),
                scenario_name: state.scenario.name.clone(),
                station_id: state.station_id.clone(),
                status: state.status,
                current_step: state.current_step,
                total_steps: state.scenario.steps.len(),
                step_status,
                error: state.error.clone(),
                timestamp: Utc::now(),
            }
        };
        self.broadcaster.broadcast_scenario_progress(&progress);
    }

    // ── Step interpreters ──────────────────────────────────

    async fn run_step(
        &self,
        step: &ScenarioStep,
        station_id: &str,
        messages: &mut mpsc::UnboundedReceiver<MessageEntry>,
    ) -> Result<Value, String> {
        let station = step.param_str("stationId").unwrap_or(station_id);
        match step.step_type {
            StepType::ApiCall => self.step_api_call(step, station).await,
            StepType::WaitForMessage => self.step_wait_for_message(step, messages).await,
            StepType::WaitForState => self.step_wait_for_state(step, station).await,
            StepType::Delay => {
                let duration = step
                    .param_u64("duration")
                    .ok_or_else(|| "delay step is missing 'duration'".to_string())?;
                tokio::time::sleep(Duration::from_millis(duration)).await;
                Ok(json!({ "delayed_ms": duration }))
            }
            StepType::WaitCondition => self.step_wait_condition(step, station).await,
            StepType::SendMessage => self.step_send_message(step, station),
            StepType::Assert => step_assert(step),
        }
    }

    async fn step_api_call(&self, step: &ScenarioStep, station: &str) -> Result<Value, String> {
        let action = step
            .param_str("action")
            .ok_or_else(|| "api_call step is missing 'action'".to_string())?;
        let connector_id = step.param_u64("connectorId").map(|id| id as u32);
        debug!(station_id = station, action, "Scenario api_call");

        match action {
            "start_station" => self
                .manager
                .start_station(station)
                .await
                .map(|_| json!({ "started": station }))
                .map_err(|e| e.to_string()),
            "stop_station" => self
                .manager
                .stop_station(station)
                .await
                .map(|_| json!({ "stopped": station }))
                .map_err(|e| e.to_string()),
            "start_charging" => {
                let id_tag = step.param_str("idTag").map(str::to_string);
                self.manager
                    .start_charging(station, connector_id, id_tag)
                    .await
                    .map(|tx| json!({ "transactionId": tx }))
                    .map_err(|e| e.to_string())
            }
            "stop_charging" => {
                let connector = connector_id.ok_or_else(|| {
                    "stop_charging requires 'connectorId'".to_string()
                })?;
                let reason = step.param_str("reason").map(str::to_string);
                self.manager
                    .stop_charging(station, connector, reason)
                    .await
                    .map(|tx| json!({ "transactionId": tx }))
                    .map_err(|e| e.to_string())
            }
            "send_heartbeat" => self
                .manager
                .send_heartbeat(station)
                .await
                .map(|_| json!({ "heartbeat": true }))
                .map_err(|e| e.to_string()),
            "reset" => {
                let hard = step.param_str("type") == Some("Hard");
                self.manager
                    .reset_station(station, hard)
                    .await
                    .map(|_| json!({ "reset": if hard { "hard" } else { "soft" } }))
                    .map_err(|e| e.to_string())
            }
            other => Err(format!("unknown api_call action '{}'", other)),
        }
    }

    async fn step_wait_for_message(
        &self,
        step: &ScenarioStep,
        messages: &mut mpsc::UnboundedReceiver<MessageEntry>,
    ) -> Result<Value, String> {
        let direction = match step.param_str("direction") {
            Some("sent") => Direction::Sent,
            Some("received") => Direction::Received,
            other => return Err(format!("bad wait_for_message direction {:?}", other)),
        };
        let action = step
            .param_str("action")
            .ok_or_else(|| "wait_for_message step is missing 'action'".to_string())?;

        loop {
            let entry = messages
                .recv()
                .await
                .ok_or_else(|| "message stream closed".to_string())?;
            if entry.direction != direction || entry.action.as_deref() != Some(action) {
                continue;
            }
            if let Some(validation) = &step.validation {
                let matches = validation
                    .iter()
                    .all(|(key, expected)| &entry.payload[key] == expected);
                if !matches {
                    continue;
                }
            }
            return Ok(json!({
                "action": entry.action,
                "direction": entry.direction,
                "payload": entry.payload,
            }));
        }
    }

    async fn step_wait_for_state(
        &self,
        step: &ScenarioStep,
        station: &str,
    ) -> Result<Value, String> {
        let target = step.param_str("target").unwrap_or("station");
        let wanted = step
            .param_str("state")
            .ok_or_else(|| "wait_for_state step is missing 'state'".to_string())?
            .to_lowercase();
        let connector_id = step.param_u64("connectorId").map(|id| id as u32);

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let current = match target {
                "station" => {
                    let handle = match self.manager.get_station(station) {
                        Ok(handle) => handle,
                        Err(_) => continue,
                    };
                    format!("{:?}", handle.lifecycle().await).to_lowercase()
                }
                "connector" => {
                    let connector = connector_id
                        .ok_or_else(|| "connector target requires 'connectorId'".to_string())?;
                    let handle = match self.manager.get_station(station) {
                        Ok(handle) => handle,
                        Err(_) => continue,
                    };
                    match handle.connector_status(connector).await {
                        Some(status) => format!("{:?}", status).to_lowercase(),
                        None => continue,
                    }
                }
                other => return Err(format!("unknown wait_for_state target '{}'", other)),
            };
            if current == wanted {
                return Ok(json!({ "state": current }));
            }
        }
    }

    async fn step_wait_condition(
        &self,
        step: &ScenarioStep,
        station: &str,
    ) -> Result<Value, String> {
        let condition = step
            .param_str("condition")
            .ok_or_else(|| "wait_condition step is missing 'condition'".to_string())?
            .to_string();
        let connector_id = step.param_u64("connectorId").map(|id| id as u32);

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let holds = match condition.as_str() {
                "station_connected" => self.manager.is_station_connected(station),
                "station_disconnected" => !self.manager.is_station_connected(station),
                "connector_available" | "connector_charging" => {
                    let connector = connector_id
                        .ok_or_else(|| format!("{} requires 'connectorId'", condition))?;
                    match self.manager.get_station(station) {
                        Ok(handle) => {
                            let status = handle.connector_status(connector).await;
                            match condition.as_str() {
                                "connector_available" => {
                                    status == Some(crate::domain::ConnectorStatus::Available)
                                }
                                _ => status == Some(crate::domain::ConnectorStatus::Charging),
                            }
                        }
                        Err(_) => false,
                    }
                }
                "transaction_active" => match self.manager.get_station(station) {
                    Ok(handle) => handle.has_active_transaction().await,
                    Err(_) => false,
                },
                other => return Err(format!("unknown wait_condition '{}'", other)),
            };
            if holds {
                return Ok(json!({ "condition": condition }));
            }
        }
    }

    fn step_send_message(&self, step: &ScenarioStep, station: &str) -> Result<Value, String> {
        let message_type = step.param_u64("messageType").unwrap_or(2);
        let action = step.param_str("action").unwrap_or_default();
        let payload = step
            .params
            .get("payload")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let frame = match message_type {
            2 => OcppFrame::call(action, payload),
            3 => OcppFrame::result(
                step.param_str("uniqueId").unwrap_or_default(),
                payload,
            ),
            4 => OcppFrame::error(
                step.param_str("uniqueId").unwrap_or_default(),
                crate::ocpp::CallErrorCode::GenericError,
                step.param_str("errorDescription").unwrap_or_default(),
            ),
            other => return Err(format!("bad messageType {}", other)),
        };
        let raw = frame.serialize();
        self.manager
            .send_custom_message(station, raw.clone())
            .map(|_| json!({ "sent": raw }))
            .map_err(|e| e.to_string())
    }
}

fn step_assert(step: &ScenarioStep) -> Result<Value, String> {
    let condition = step.param_str("condition").unwrap_or("equals");
    let expected = step.params.get("expected").cloned().unwrap_or(Value::Null);
    let actual = step.params.get("actual").cloned().unwrap_or(Value::Null);

    let pass = match condition {
        "equals" => expected == actual,
        "not_equals" => expected != actual,
        "exists" => !actual.is_null(),
        other => return Err(format!("unknown assert condition '{}'", other)),
    };
    if pass {
        Ok(json!({ "condition": condition, "expected": expected, "actual": actual }))
    } else {
        warn!(condition, %expected, %actual, "Assertion failed");
        Err(format!(
            "assertion '{}' failed: expected {} actual {}",
            condition, expected, actual
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::domain::{MessageType, OcppVersion};
    use crate::messagelog::MessageLog;
    use crate::ocpp::ValidationMode;
    use crate::persistence::MemoryStore;
    use crate::shared::shutdown::ShutdownSignal;
    use crate::station::{StationDefaults, StationManager};
    use crate::transport::ConnectionPool;

    fn runner() -> (SharedScenarioRunner, SharedMessageLog, ShutdownSignal) {
        let store = MemoryStore::shared();
        let pool = ConnectionPool::shared();
        let log = MessageLog::new(store.clone());
        let shutdown = ShutdownSignal::new();
        log.start(shutdown.clone());
        let router = crate::dispatch::build_router(
            pool.clone(),
            log.clone(),
            Duration::from_millis(500),
            ValidationMode::Lenient,
        );
        let manager = StationManager::new(
            pool,
            router,
            log.clone(),
            Broadcaster::shared(),
            store,
            StationDefaults::default(),
            Duration::from_secs(30),
            0,
        );
        (
            ScenarioRunner::new(manager, log.clone(), Broadcaster::shared()),
            log,
            shutdown,
        )
    }

    fn scenario(steps: Vec<ScenarioStep>) -> Scenario {
        Scenario {
            id: String::new(),
            name: "test".into(),
            description: String::new(),
            default_station_id: Some("CP-1".into()),
            steps,
            tags: vec![],
            is_builtin: false,
        }
    }

    async fn wait_terminal(runner: &SharedScenarioRunner, id: &str) -> Execution {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(execution) = runner.get_execution(id).await {
                    if execution.status.is_terminal() {
                        return execution;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("execution never finished")
    }

    #[tokio::test]
    async fn assert_and_delay_complete() {
        let (runner, _log, _shutdown) = runner();
        let id = runner
            .execute(
                scenario(vec![
                    ScenarioStep::new(StepType::Assert)
                        .with_param("condition", "equals")
                        .with_param("expected", 1)
                        .with_param("actual", 1),
                    ScenarioStep::new(StepType::Delay).with_param("duration", 50),
                    ScenarioStep::new(StepType::Assert)
                        .with_param("condition", "exists")
                        .with_param("actual", "something"),
                ]),
                None,
            )
            .unwrap();

        let execution = wait_terminal(&runner, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution
            .step_results
            .iter()
            .all(|r| r.status == StepStatus::Success));
    }

    #[tokio::test]
    async fn failed_assert_without_jump_fails_execution() {
        let (runner, _log, _shutdown) = runner();
        let id = runner
            .execute(
                scenario(vec![
                    ScenarioStep::new(StepType::Assert)
                        .with_param("condition", "equals")
                        .with_param("expected", 1)
                        .with_param("actual", 2),
                    ScenarioStep::new(StepType::Delay).with_param("duration", 10),
                ]),
                None,
            )
            .unwrap();

        let execution = wait_terminal(&runner, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step_results[0].status, StepStatus::Failed);
        // Subsequent step never ran
        assert_eq!(execution.step_results[1].status, StepStatus::Pending);
        assert!(execution.error.unwrap().contains("assertion"));
    }

    #[tokio::test]
    async fn on_failure_jump_recovers() {
        let (runner, _log, _shutdown) = runner();
        let mut failing = ScenarioStep::new(StepType::Assert)
            .with_param("condition", "equals")
            .with_param("expected", 1)
            .with_param("actual", 2);
        failing.on_failure = Some("cleanup".into());
        let mut cleanup = ScenarioStep::new(StepType::Delay).with_param("duration", 10);
        cleanup.label = Some("cleanup".into());

        let id = runner.execute(scenario(vec![failing, cleanup]), None).unwrap();
        let execution = wait_terminal(&runner, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_results[1].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn step_timeout_fails_the_step() {
        let (runner, _log, _shutdown) = runner();
        // CP-1 never exists, so the condition cannot hold
        let id = runner
            .execute(
                scenario(vec![ScenarioStep::new(StepType::WaitCondition)
                    .with_param("condition", "station_connected")
                    .with_timeout_ms(150)]),
                None,
            )
            .unwrap();

        let execution = wait_terminal(&runner, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.step_results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn wait_for_message_matches_validation_fields() {
        let (runner, log, _shutdown) = runner();
        let mut step = ScenarioStep::new(StepType::WaitForMessage)
            .with_param("direction", "sent")
            .with_param("action", "StartTransaction")
            .with_timeout_ms(5_000);
        let mut validation = serde_json::Map::new();
        validation.insert("connectorId".into(), json!(2));
        step.validation = Some(validation);

        let id = runner.execute(scenario(vec![step]), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Non-matching entries first: wrong station, wrong connector
        for (station, connector) in [("CP-2", 2), ("CP-1", 1), ("CP-1", 2)] {
            log.log_message(
                MessageEntry::new(
                    station,
                    Direction::Sent,
                    MessageType::Call,
                    uuid::Uuid::new_v4().to_string(),
                    OcppVersion::V16,
                    json!({ "connectorId": connector }),
                    "[2,...]",
                )
                .with_action("StartTransaction"),
            );
        }

        let execution = wait_terminal(&runner, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let output = execution.step_results[0].output.clone().unwrap();
        assert_eq!(output["payload"]["connectorId"], 2);
    }

    #[tokio::test]
    async fn pause_defers_the_delay_and_resume_releases_it() {
        let (runner, _log, _shutdown) = runner();
        let id = runner
            .execute(
                scenario(vec![
                    ScenarioStep::new(StepType::Assert)
                        .with_param("condition", "equals")
                        .with_param("expected", 1)
                        .with_param("actual", 1),
                    ScenarioStep::new(StepType::Delay).with_param("duration", 200),
                ]),
                None,
            )
            .unwrap();

        let started = std::time::Instant::now();
        runner.pause(&id).await.unwrap();
        assert_eq!(
            runner.get_execution(&id).await.unwrap().status,
            ExecutionStatus::Paused
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        runner.resume(&id).await.unwrap();

        let execution = wait_terminal(&runner, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        // Total wall time covers the pause plus the (unpaused) delay
        assert!(started.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn cancel_unblocks_a_paused_execution() {
        let (runner, _log, _shutdown) = runner();
        let id = runner
            .execute(
                scenario(vec![
                    ScenarioStep::new(StepType::Delay).with_param("duration", 50),
                    ScenarioStep::new(StepType::Delay).with_param("duration", 60_000),
                ]),
                None,
            )
            .unwrap();

        runner.pause(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.cancel(&id).await.unwrap();

        let execution = wait_terminal(&runner, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_interrupts_a_running_delay() {
        let (runner, _log, _shutdown) = runner();
        let id = runner
            .execute(
                scenario(vec![ScenarioStep::new(StepType::Delay).with_param("duration", 60_000)]),
                None,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.cancel(&id).await.unwrap();

        let execution = wait_terminal(&runner, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.step_results[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn builtin_scenarios_are_seeded_and_protected() {
        let (runner, _log, _shutdown) = runner();
        let builtins = runner.list_scenarios();
        assert!(builtins.iter().any(|s| s.is_builtin));
        let builtin_id = builtins.iter().find(|s| s.is_builtin).unwrap().id.clone();
        assert!(runner.remove_scenario(&builtin_id).is_err());
    }

    #[tokio::test]
    async fn custom_scenarios_validate_on_add() {
        let (runner, _log, _shutdown) = runner();
        let bad = scenario(vec![]);
        assert!(runner.add_scenario(bad).is_err());

        let good = scenario(vec![ScenarioStep::new(StepType::Delay).with_param("duration", 1)]);
        let id = runner.add_scenario(good).unwrap();
        assert!(runner.get_scenario(&id).is_some());
        runner.remove_scenario(&id).unwrap();
        assert!(runner.get_scenario(&id).is_none());
    }
}
