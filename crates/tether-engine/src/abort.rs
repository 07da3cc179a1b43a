//! Abort / interrupt coordination.
//!
//! `running → interrupting → aborted`: a graceful request asks the agent to
//! stop itself; a second request inside `escalation_window`, a missing or
//! failing interrupter, or an agent still running after `interrupt_grace`
//! escalates to a hard abort. A hard abort cancels the runner's token,
//! marks it aborted, and denies its pending permission questions.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use tether_core::events::{EventPayload, RunStatus};
use tether_core::ids::OperationId;

use crate::permission::PermissionBroker;
use crate::registry::RunnerRegistry;
use crate::runner::EventRunner;

#[derive(Clone, Debug)]
pub struct AbortConfig {
    /// A second graceful request within this window becomes a hard abort.
    pub escalation_window: Duration,
    /// How long the cooperative interrupt call itself may take.
    pub interrupt_timeout: Duration,
    /// How long an interrupted agent has to actually finish.
    pub interrupt_grace: Duration,
}

impl Default for AbortConfig {
    fn default() -> Self {
        Self {
            escalation_window: Duration::from_secs(3),
            interrupt_timeout: Duration::from_secs(5),
            interrupt_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortMode {
    Graceful,
    Hard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortOutcome {
    /// The agent accepted a cooperative interrupt and is winding down.
    Interrupting,
    Aborted,
    /// Unknown operation, or it already finished.
    NotFound,
}

pub struct AbortCoordinator {
    registry: Arc<RunnerRegistry>,
    broker: Arc<PermissionBroker>,
    config: AbortConfig,
}

impl AbortCoordinator {
    pub fn new(
        registry: Arc<RunnerRegistry>,
        broker: Arc<PermissionBroker>,
        config: AbortConfig,
    ) -> Self {
        Self {
            registry,
            broker,
            config,
        }
    }

    pub async fn abort(&self, operation_id: &OperationId, mode: AbortMode) -> AbortOutcome {
        let Some(runner) = self.registry.get_by_operation(operation_id) else {
            return AbortOutcome::NotFound;
        };
        if !runner.is_running() {
            return AbortOutcome::NotFound;
        }
        match mode {
            AbortMode::Hard => hard_abort(&runner, &self.broker),
            AbortMode::Graceful => self.interrupt(&runner).await,
        }
    }

    async fn interrupt(&self, runner: &Arc<EventRunner>) -> AbortOutcome {
        let operation_id = runner.operation_id();
        let now = Instant::now();
        if let Some(previous) = runner.note_interrupt_request(now) {
            if now.saturating_duration_since(previous) <= self.config.escalation_window {
                tracing::info!(operation_id = %operation_id, "repeated stop request, escalating");
                return hard_abort(runner, &self.broker);
            }
        }

        let Some(interrupter) = runner.interrupter() else {
            tracing::debug!(operation_id = %operation_id, "no cooperative interrupt available");
            return hard_abort(runner, &self.broker);
        };

        match tokio::time::timeout(self.config.interrupt_timeout, interrupter.interrupt()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(operation_id = %operation_id, error = %e, "interrupt failed, aborting");
                return hard_abort(runner, &self.broker);
            }
            Err(_) => {
                tracing::warn!(operation_id = %operation_id, "interrupt timed out, aborting");
                return hard_abort(runner, &self.broker);
            }
        }

        runner.buffer_event(EventPayload::Interrupting);
        tracing::info!(operation_id = %operation_id, "interrupt requested");

        let watched = Arc::downgrade(runner);
        let broker = Arc::clone(&self.broker);
        let grace = self.config.interrupt_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(runner) = watched.upgrade() {
                if runner.is_running() {
                    tracing::warn!(
                        operation_id = %runner.operation_id(),
                        "agent did not stop after interrupt, aborting"
                    );
                    hard_abort(&runner, &broker);
                }
            }
        });

        AbortOutcome::Interrupting
    }

    /// Hard-abort every running operation. Used on shutdown.
    pub fn abort_all(&self) -> usize {
        let running = self.registry.running();
        for runner in &running {
            hard_abort(runner, &self.broker);
        }
        running.len()
    }
}

fn hard_abort(runner: &EventRunner, broker: &PermissionBroker) -> AbortOutcome {
    runner.set_status(RunStatus::Aborted);
    let denied = broker.cancel_for_operation(runner.operation_id());
    runner.cancel_token().cancel();
    tracing::info!(operation_id = %runner.operation_id(), denied, "operation aborted");
    AbortOutcome::Aborted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tether_core::events::OperationKind;
    use tether_core::ids::SessionId;
    use tether_core::permission::PermissionOutcome;

    use crate::backend::Interrupter;
    use crate::error::EngineError;
    use crate::permission::{PermissionConfig, ABORTED_MESSAGE};
    use crate::registry::ReaperConfig;

    #[derive(Default)]
    struct CountingInterrupter {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Interrupter for CountingInterrupter {
        async fn interrupt(&self) -> Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EngineError::Interrupt("refused".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        coordinator: AbortCoordinator,
        registry: Arc<RunnerRegistry>,
        broker: Arc<PermissionBroker>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(RunnerRegistry::new(ReaperConfig::default()));
        let broker = Arc::new(PermissionBroker::new(PermissionConfig::default()));
        let coordinator = AbortCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&broker),
            AbortConfig::default(),
        );
        Fixture {
            coordinator,
            registry,
            broker,
        }
    }

    fn register(registry: &RunnerRegistry) -> Arc<EventRunner> {
        let runner = Arc::new(EventRunner::new(
            OperationId::new(),
            SessionId::new(),
            OperationKind::Query,
            100,
        ));
        registry.register(Arc::clone(&runner)).unwrap();
        runner
    }

    #[tokio::test]
    async fn unknown_or_finished_operation_is_not_found() {
        let f = fixture();
        assert_eq!(
            f.coordinator.abort(&OperationId::new(), AbortMode::Hard).await,
            AbortOutcome::NotFound
        );

        let runner = register(&f.registry);
        runner.set_status(RunStatus::Completed);
        assert_eq!(
            f.coordinator.abort(runner.operation_id(), AbortMode::Hard).await,
            AbortOutcome::NotFound
        );
        assert!(!runner.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn hard_abort_cancels_and_denies_pending_permissions() {
        let f = fixture();
        let runner = register(&f.registry);

        let ask = |broker: &Arc<PermissionBroker>| {
            let (broker, runner) = (Arc::clone(broker), Arc::clone(&runner));
            tokio::spawn(async move { broker.request(&runner, "Bash", json!({}), None).await })
        };
        let first = ask(&f.broker);
        let second = ask(&f.broker);
        while f.broker.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        let outcome = f.coordinator.abort(runner.operation_id(), AbortMode::Hard).await;
        assert_eq!(outcome, AbortOutcome::Aborted);
        assert!(runner.cancel_token().is_cancelled());
        assert_eq!(runner.status(), RunStatus::Aborted);
        assert_eq!(f.broker.pending_count(), 0);

        for task in [first, second] {
            match task.await.unwrap() {
                PermissionOutcome::Deny { message, interrupt } => {
                    assert_eq!(message, ABORTED_MESSAGE);
                    assert!(interrupt);
                }
                other => panic!("expected deny, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn graceful_without_interrupter_falls_through_to_hard() {
        let f = fixture();
        let runner = register(&f.registry);
        let outcome = f.coordinator.abort(runner.operation_id(), AbortMode::Graceful).await;
        assert_eq!(outcome, AbortOutcome::Aborted);
        assert!(runner.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn failing_interrupter_falls_through_to_hard() {
        let f = fixture();
        let runner = register(&f.registry);
        let interrupter = Arc::new(CountingInterrupter {
            fail: true,
            ..Default::default()
        });
        runner.set_interrupter(Some(interrupter.clone()));

        let outcome = f.coordinator.abort(runner.operation_id(), AbortMode::Graceful).await;
        assert_eq!(outcome, AbortOutcome::Aborted);
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_then_second_request_escalates() {
        let f = fixture();
        let runner = register(&f.registry);
        let interrupter = Arc::new(CountingInterrupter::default());
        runner.set_interrupter(Some(interrupter.clone()));

        let outcome = f.coordinator.abort(runner.operation_id(), AbortMode::Graceful).await;
        assert_eq!(outcome, AbortOutcome::Interrupting);
        assert!(runner.is_running());
        assert!(runner.is_interrupting());
        assert!(!runner.cancel_token().is_cancelled());
        let last = runner.replay_from(0).events.pop().unwrap();
        assert_eq!(last.event_type(), "interrupting");

        tokio::time::advance(Duration::from_secs(1)).await;
        let outcome = f.coordinator.abort(runner.operation_id(), AbortMode::Graceful).await;
        assert_eq!(outcome, AbortOutcome::Aborted);
        assert!(runner.cancel_token().is_cancelled());
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_agent_that_keeps_running_is_aborted() {
        let f = fixture();
        let runner = register(&f.registry);
        runner.set_interrupter(Some(Arc::new(CountingInterrupter::default())));

        f.coordinator.abort(runner.operation_id(), AbortMode::Graceful).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(runner.status(), RunStatus::Aborted);
        assert!(runner.cancel_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_agent_that_finishes_is_left_alone() {
        let f = fixture();
        let runner = register(&f.registry);
        runner.set_interrupter(Some(Arc::new(CountingInterrupter::default())));

        f.coordinator.abort(runner.operation_id(), AbortMode::Graceful).await;
        runner.set_status(RunStatus::Completed);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(runner.status(), RunStatus::Completed);
        assert!(!runner.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn abort_all_hits_only_running_operations() {
        let f = fixture();
        let a = register(&f.registry);
        let b = register(&f.registry);
        let done = register(&f.registry);
        done.set_status(RunStatus::Completed);

        assert_eq!(f.coordinator.abort_all(), 2);
        assert!(a.cancel_token().is_cancelled());
        assert!(b.cancel_token().is_cancelled());
        assert!(!done.cancel_token().is_cancelled());
    }
}
