//! Pure state-machine rules for station lifecycle and connector status
//!
//! The transition tables live here so they can be exercised without any
//! transport or timers. The station driver consults these before mutating
//! runtime state; an operation invalid in the current state is rejected
//! synchronously and mutates nothing.

use crate::domain::{ConnectorStatus, StationLifecycle};

// ── Station lifecycle ──────────────────────────────────────────

/// Events driving the station lifecycle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    StartRequested,
    SocketConnected,
    BootStarted,
    BootAccepted,
    /// CSMS answered Pending/Rejected; the station waits and retries
    BootDeferred,
    ConnectionLost,
    StopRequested,
    Stopped,
    FatalFault,
}

/// Next lifecycle state, or `None` when the event is invalid in `current`.
pub fn lifecycle_transition(
    current: StationLifecycle,
    event: LifecycleEvent,
) -> Option<StationLifecycle> {
    use LifecycleEvent::*;
    use StationLifecycle::*;

    match (current, event) {
        (Disconnected, StartRequested) | (Faulted, StartRequested) => Some(Connecting),
        (Connecting, SocketConnected) => Some(Connected),
        (Connected, BootStarted) => Some(Booting),
        (Booting, BootAccepted) => Some(Operational),
        (Booting, BootDeferred) => Some(Connected),
        // Reconnection is internal to the client; the station surfaces it
        // as Connecting until the boot handshake completes again.
        (Connected, ConnectionLost)
        | (Booting, ConnectionLost)
        | (Operational, ConnectionLost) => Some(Connecting),
        (_, StopRequested) => Some(Stopping),
        (Stopping, Stopped) | (Connecting, Stopped) => Some(Disconnected),
        (_, FatalFault) => Some(Faulted),
        _ => None,
    }
}

// ── Connector state ────────────────────────────────────────────

/// Edge-triggered events driving one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// RemoteStart accepted or local start requested
    StartRequested,
    /// StartTransaction acknowledged, charging begins
    TransactionStarted,
    /// RemoteStop accepted or local stop requested
    StopRequested,
    /// StopTransaction acknowledged
    TransactionStopped,
    /// Authorization rejected or start aborted
    StartAborted,
    SuspendByEv,
    SuspendByEvse,
    Resume,
    Reserve,
    ReservationEnded,
    MakeUnavailable,
    MakeAvailable,
    Fault,
    FaultCleared,
}

/// Next connector status, or `None` when the event is invalid in `current`.
pub fn connector_transition(
    current: ConnectorStatus,
    event: ConnectorEvent,
) -> Option<ConnectorStatus> {
    use ConnectorEvent::*;
    use ConnectorStatus::*;

    match (current, event) {
        (Available, StartRequested) => Some(Preparing),
        (Preparing, TransactionStarted) => Some(Charging),
        (Preparing, StartAborted) => Some(Available),
        (Charging, StopRequested)
        | (SuspendedEv, StopRequested)
        | (SuspendedEvse, StopRequested) => Some(Finishing),
        (Finishing, TransactionStopped) => Some(Available),
        (Charging, SuspendByEv) => Some(SuspendedEv),
        (Charging, SuspendByEvse) => Some(SuspendedEvse),
        (SuspendedEv, Resume) | (SuspendedEvse, Resume) => Some(Charging),
        (Available, Reserve) => Some(Reserved),
        (Reserved, ReservationEnded) => Some(Available),
        (Reserved, StartRequested) => Some(Preparing),
        (Available, MakeUnavailable) => Some(Unavailable),
        (Unavailable, MakeAvailable) => Some(Available),
        // Faulted is reachable from any state and exits only to Available
        (_, Fault) => Some(Faulted),
        (Faulted, FaultCleared) => Some(Available),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectorEvent as E;
    use ConnectorStatus as S;

    #[test]
    fn full_charging_cycle() {
        let mut status = S::Available;
        for (event, expected) in [
            (E::StartRequested, S::Preparing),
            (E::TransactionStarted, S::Charging),
            (E::StopRequested, S::Finishing),
            (E::TransactionStopped, S::Available),
        ] {
            status = connector_transition(status, event).unwrap();
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn suspension_branches_return_to_charging() {
        let suspended = connector_transition(S::Charging, E::SuspendByEv).unwrap();
        assert_eq!(suspended, S::SuspendedEv);
        assert_eq!(connector_transition(suspended, E::Resume), Some(S::Charging));

        let suspended = connector_transition(S::Charging, E::SuspendByEvse).unwrap();
        assert_eq!(suspended, S::SuspendedEvse);
        assert_eq!(connector_transition(suspended, E::Resume), Some(S::Charging));
    }

    #[test]
    fn stop_allowed_from_suspended() {
        assert_eq!(
            connector_transition(S::SuspendedEv, E::StopRequested),
            Some(S::Finishing)
        );
        assert_eq!(
            connector_transition(S::SuspendedEvse, E::StopRequested),
            Some(S::Finishing)
        );
    }

    #[test]
    fn start_rejected_while_occupied() {
        for occupied in [S::Preparing, S::Charging, S::SuspendedEv, S::Finishing] {
            assert_eq!(connector_transition(occupied, E::StartRequested), None);
        }
    }

    #[test]
    fn faulted_from_anywhere_exits_only_to_available() {
        for state in [S::Available, S::Preparing, S::Charging, S::Finishing, S::Reserved] {
            assert_eq!(connector_transition(state, E::Fault), Some(S::Faulted));
        }
        assert_eq!(connector_transition(S::Faulted, E::FaultCleared), Some(S::Available));
        assert_eq!(connector_transition(S::Faulted, E::StartRequested), None);
    }

    #[test]
    fn aborted_start_reverts_to_available() {
        assert_eq!(
            connector_transition(S::Preparing, E::StartAborted),
            Some(S::Available)
        );
    }

    #[test]
    fn reserved_connector_can_start() {
        assert_eq!(
            connector_transition(S::Reserved, E::StartRequested),
            Some(S::Preparing)
        );
    }

    #[test]
    fn lifecycle_boot_path() {
        use LifecycleEvent as L;
        use StationLifecycle as St;

        let mut state = St::Disconnected;
        for (event, expected) in [
            (L::StartRequested, St::Connecting),
            (L::SocketConnected, St::Connected),
            (L::BootStarted, St::Booting),
            (L::BootAccepted, St::Operational),
        ] {
            state = lifecycle_transition(state, event).unwrap();
            assert_eq!(state, expected);
        }

        // Connection loss surfaces as Connecting, then the boot handshake
        // repeats after the client reconnects.
        assert_eq!(
            lifecycle_transition(St::Operational, L::ConnectionLost),
            Some(St::Connecting)
        );
    }

    #[test]
    fn lifecycle_stop_path() {
        use LifecycleEvent as L;
        use StationLifecycle as St;

        assert_eq!(
            lifecycle_transition(St::Operational, L::StopRequested),
            Some(St::Stopping)
        );
        assert_eq!(
            lifecycle_transition(St::Stopping, L::Stopped),
            Some(St::Disconnected)
        );
    }
}
