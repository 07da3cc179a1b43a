//! Runner Registry: operation id → runner, session id → operation id, and
//! the reaper that ages out finished runners and kills abandoned commands.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether_core::events::{OperationKind, RunStatus};
use tether_core::ids::{OperationId, SessionId};

use crate::error::EngineError;
use crate::runner::EventRunner;

/// Reaper timing.
#[derive(Clone, Debug)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// How long a finished runner stays reachable for reconnects.
    pub retention: Duration,
    /// Unattended time after which a running command is killed.
    pub orphan_after: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(5 * 60),
            orphan_after: Duration::from_secs(30 * 60),
        }
    }
}

/// What one reaper pass removed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReapReport {
    pub expired: Vec<OperationId>,
    pub orphaned: Vec<OperationId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.orphaned.is_empty()
    }
}

pub struct RunnerRegistry {
    by_operation: DashMap<OperationId, Arc<EventRunner>>,
    by_session: DashMap<SessionId, OperationId>,
    completed_at: DashMap<OperationId, Instant>,
    config: ReaperConfig,
}

impl RunnerRegistry {
    pub fn new(config: ReaperConfig) -> Self {
        Self {
            by_operation: DashMap::new(),
            by_session: DashMap::new(),
            completed_at: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Insert a runner under its operation id and current session id.
    ///
    /// Fails if the operation id is taken, or if the session is still mapped
    /// to a runner that is running.
    pub fn register(&self, runner: Arc<EventRunner>) -> Result<(), EngineError> {
        let operation_id = runner.operation_id().clone();
        let session_id = runner.session_id();

        if self.by_operation.contains_key(&operation_id) {
            return Err(EngineError::Conflict(operation_id.to_string()));
        }

        match self.by_session.entry(session_id.clone()) {
            Entry::Occupied(mut entry) => {
                let busy = self
                    .by_operation
                    .get(entry.get())
                    .is_some_and(|existing| existing.is_running());
                if busy {
                    return Err(EngineError::SessionBusy(session_id.to_string()));
                }
                entry.insert(operation_id.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(operation_id.clone());
            }
        }

        self.by_operation.insert(operation_id.clone(), runner);
        tracing::debug!(operation_id = %operation_id, session_id = %session_id, "runner registered");
        Ok(())
    }

    /// Move the session mapping of `operation_id` from `old` to `new`.
    pub fn rebind_session_id(
        &self,
        operation_id: &OperationId,
        old: &SessionId,
        new: &SessionId,
    ) -> bool {
        if old == new {
            return false;
        }
        let Some(runner) = self.get_by_operation(operation_id) else {
            return false;
        };

        self.by_session.remove_if(old, |_, op| op == operation_id);
        self.by_session.insert(new.clone(), operation_id.clone());
        runner.set_session_id(new.clone());

        tracing::info!(
            operation_id = %operation_id,
            from = %old,
            to = %new,
            "session id rebound"
        );
        true
    }

    /// Start the retention clock. The runner stays reachable until reaped.
    pub fn mark_completed(&self, operation_id: &OperationId) {
        if self.by_operation.contains_key(operation_id) {
            self.completed_at.insert(operation_id.clone(), Instant::now());
        }
    }

    pub fn get_by_operation(&self, operation_id: &OperationId) -> Option<Arc<EventRunner>> {
        self.by_operation.get(operation_id).map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_session(&self, session_id: &SessionId) -> Option<Arc<EventRunner>> {
        let operation_id = self.by_session.get(session_id).map(|op| op.value().clone())?;
        self.get_by_operation(&operation_id)
    }

    pub fn remove(&self, operation_id: &OperationId) -> Option<Arc<EventRunner>> {
        let (_, runner) = self.by_operation.remove(operation_id)?;
        self.completed_at.remove(operation_id);
        self.by_session
            .remove_if(&runner.session_id(), |_, op| op == operation_id);
        Some(runner)
    }

    pub fn len(&self) -> usize {
        self.by_operation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_operation.is_empty()
    }

    pub fn running(&self) -> Vec<Arc<EventRunner>> {
        self.by_operation
            .iter()
            .filter(|r| r.is_running())
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    /// One reaper pass.
    pub fn reap(&self) -> ReapReport {
        self.reap_at(Instant::now())
    }

    pub fn reap_at(&self, now: Instant) -> ReapReport {
        let mut report = ReapReport::default();

        let expired: Vec<OperationId> = self
            .completed_at
            .iter()
            .filter(|e| now.saturating_duration_since(*e.value()) >= self.config.retention)
            .map(|e| e.key().clone())
            .collect();
        for operation_id in expired {
            if self.remove(&operation_id).is_some() {
                report.expired.push(operation_id);
            }
        }

        let orphans: Vec<Arc<EventRunner>> = self
            .by_operation
            .iter()
            .filter(|r| {
                r.kind() == OperationKind::Command
                    && r.is_running()
                    && r.listener_count() == 0
                    && now.saturating_duration_since(r.unattended_since())
                        >= self.config.orphan_after
            })
            .map(|r| Arc::clone(r.value()))
            .collect();
        for runner in orphans {
            let operation_id = runner.operation_id().clone();
            tracing::warn!(operation_id = %operation_id, "killing orphaned command");
            runner.set_status(RunStatus::Aborted);
            runner.cancel_token().cancel();
            self.remove(&operation_id);
            report.orphaned.push(operation_id);
        }

        report
    }

    /// Spawn the fixed-interval reaper.
    pub fn start_reaper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = registry.reap();
                        if !report.is_empty() {
                            tracing::info!(
                                expired = report.expired.len(),
                                orphaned = report.orphaned.len(),
                                "reaped runners"
                            );
                        }
                    }
                }
            }
        })
    }
}
