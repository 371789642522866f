//! Cooperative shutdown
//!
//! A level-triggered stop signal built on a watch channel: the stopped
//! state is retained, so a watcher taken after the trigger still resolves
//! immediately and select loops need no subscribe-before-trigger
//! discipline. Station timers, the sync loop, the message-log consumer,
//! and scenario cancellation all stop through this signal.
//!
//! The coordinator drains the emulator's subsystems as named phases
//! inside one shared budget and reports which phase exhausted it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cloneable stop signal. Triggering is idempotent; the stopped state is
/// permanent for the signal's lifetime.
#[derive(Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Request stop.
    pub fn trigger(&self) {
        self.state.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.state.borrow()
    }

    /// Watcher for select loops. Taking one at task start is enough; an
    /// already-requested stop resolves on the first poll.
    pub fn watcher(&self) -> ShutdownWatch {
        ShutdownWatch {
            rx: self.state.subscribe(),
        }
    }

    /// Resolve once stop is requested.
    pub async fn wait(&self) {
        self.watcher().stopped().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed view of a [`ShutdownSignal`] for one task.
pub struct ShutdownWatch {
    rx: watch::Receiver<bool>,
}

impl ShutdownWatch {
    /// Resolve once stop is requested. Cancel-safe, so it can race other
    /// arms of a `select!` loop across iterations. A signal whose every
    /// handle was dropped counts as stopped; an orphaned task has nothing
    /// left to run for.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// One named cleanup step run by [`ShutdownCoordinator::drain`].
pub type DrainPhase = (&'static str, Pin<Box<dyn Future<Output = ()> + Send>>);

/// Waits for the shutdown trigger, then drains subsystems phase by phase
/// within the configured budget.
pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
    budget: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            signal: ShutdownSignal::new(),
            budget: Duration::from_secs(timeout_secs),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Trigger the shutdown signal on SIGTERM/SIGINT.
    pub fn spawn_signal_listener(&self) {
        let signal = self.signal.clone();
        tokio::spawn(async move {
            wait_for_os_signal().await;
            signal.trigger();
        });
    }

    /// Block until shutdown is requested, then run each phase in order.
    /// Every phase gets whatever remains of the shared budget; the first
    /// one to exhaust it is returned as the error and the rest are
    /// skipped.
    pub async fn drain(&self, phases: Vec<DrainPhase>) -> Result<(), &'static str> {
        self.signal.wait().await;
        info!(
            budget_secs = self.budget.as_secs(),
            phases = phases.len(),
            "Draining subsystems for shutdown"
        );

        let deadline = Instant::now() + self.budget;
        for (name, phase) in phases {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(phase = name, "Skipped: shutdown budget already exhausted");
                return Err(name);
            }
            let started = Instant::now();
            match tokio::time::timeout(remaining, phase).await {
                Ok(()) => {
                    debug!(
                        phase = name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Subsystem drained"
                    );
                }
                Err(_) => {
                    warn!(
                        phase = name,
                        budget_secs = self.budget.as_secs(),
                        "Subsystem exhausted the shutdown budget"
                    );
                    return Err(name);
                }
            }
        }
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(30)
    }
}

async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM signal"),
            _ = sigint.recv() => info!("Received SIGINT signal (Ctrl+C)"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C signal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn late_watcher_observes_earlier_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        // Taken after the trigger: must still resolve
        let mut watch = signal.watcher();
        watch.stopped().await;
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn wait_resolves_for_all_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        let waiter = tokio::spawn(async move { clone.wait().await });
        signal.trigger();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn drain_runs_phases_in_order() {
        let coordinator = ShutdownCoordinator::new(5);
        coordinator.signal().trigger();

        let sequence = Arc::new(AtomicUsize::new(0));
        let first = sequence.clone();
        let second = sequence.clone();
        let result = coordinator
            .drain(vec![
                (
                    "first",
                    Box::pin(async move {
                        first.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).unwrap();
                    }),
                ),
                (
                    "second",
                    Box::pin(async move {
                        second.compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst).unwrap();
                    }),
                ),
            ])
            .await;

        assert_eq!(result, Ok(()));
        assert_eq!(sequence.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drain_reports_the_phase_that_blew_the_budget() {
        let coordinator = ShutdownCoordinator::new(1);
        coordinator.signal().trigger();

        let ran_after = Arc::new(AtomicUsize::new(0));
        let marker = ran_after.clone();
        let result = coordinator
            .drain(vec![
                ("stuck", Box::pin(std::future::pending())),
                (
                    "never-reached",
                    Box::pin(async move {
                        marker.store(1, Ordering::SeqCst);
                    }),
                ),
            ])
            .await;

        assert_eq!(result, Err("stuck"));
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
    }
}
