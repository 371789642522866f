//! Builtin scenario library
//!
//! Seeded into the runner at startup; useful as smoke tests against a
//! freshly configured CSMS.

use crate::domain::{Scenario, ScenarioStep, StepType};

fn step(step_type: StepType) -> ScenarioStep {
    ScenarioStep::new(step_type)
}

pub fn builtin_scenarios() -> Vec<Scenario> {
    vec![boot_and_heartbeat(), charge_cycle()]
}

/// Connect, boot, observe one heartbeat, disconnect.
fn boot_and_heartbeat() -> Scenario {
    Scenario {
        id: "builtin-boot-heartbeat".into(),
        name: "Boot and heartbeat".into(),
        description: "Start the station, wait for the boot handshake and the first heartbeat"
            .into(),
        default_station_id: None,
        steps: vec![
            step(StepType::ApiCall).with_param("action", "start_station"),
            step(StepType::WaitForState)
                .with_param("target", "station")
                .with_param("state", "connected")
                .with_timeout_ms(10_000),
            step(StepType::WaitForMessage)
                .with_param("direction", "sent")
                .with_param("action", "BootNotification")
                .with_timeout_ms(15_000),
            step(StepType::WaitForMessage)
                .with_param("direction", "sent")
                .with_param("action", "Heartbeat")
                .with_timeout_ms(90_000),
            step(StepType::ApiCall).with_param("action", "stop_station"),
        ],
        tags: vec!["smoke".into(), "boot".into()],
        is_builtin: true,
    }
}

/// Full charge cycle on connector 1.
fn charge_cycle() -> Scenario {
    Scenario {
        id: "builtin-charge-cycle".into(),
        name: "Charge cycle".into(),
        description: "Start charging on connector 1, let energy accumulate, stop".into(),
        default_station_id: None,
        steps: vec![
            step(StepType::ApiCall).with_param("action", "start_station"),
            step(StepType::WaitForState)
                .with_param("target", "station")
                .with_param("state", "operational")
                .with_timeout_ms(15_000),
            step(StepType::ApiCall)
                .with_param("action", "start_charging")
                .with_param("connectorId", 1),
            step(StepType::WaitForState)
                .with_param("target", "connector")
                .with_param("connectorId", 1)
                .with_param("state", "charging")
                .with_timeout_ms(10_000),
            step(StepType::Delay).with_param("duration", 5_000),
            step(StepType::ApiCall)
                .with_param("action", "stop_charging")
                .with_param("connectorId", 1),
            step(StepType::WaitCondition)
                .with_param("condition", "connector_available")
                .with_param("connectorId", 1)
                .with_timeout_ms(10_000),
            step(StepType::ApiCall).with_param("action", "stop_station"),
        ],
        tags: vec!["smoke".into(), "charging".into()],
        is_builtin: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_validate() {
        let scenarios = builtin_scenarios();
        assert!(!scenarios.is_empty());
        for scenario in scenarios {
            scenario.validate().unwrap();
            assert!(scenario.is_builtin);
        }
    }
}
