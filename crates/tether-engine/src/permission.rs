//! Permission Broker.
//!
//! Each outstanding question is a one-shot sender plus two timer tasks. A
//! user decision, the deny timer, and the abort cascade all go through
//! [`PermissionBroker::settle`], which removes the entry, stops both timers
//! and answers exactly once.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use tether_core::events::EventPayload;
use tether_core::ids::{OperationId, RequestId};
use tether_core::permission::{PermissionMode, PermissionOutcome};

use crate::backend::PermissionGate;
use crate::runner::EventRunner;

pub const ABORTED_MESSAGE: &str = "Operation aborted";
pub const TIMED_OUT_MESSAGE: &str = "Permission request timed out";
pub const DENIED_MESSAGE: &str = "User denied permission";

#[derive(Clone, Debug)]
pub struct PermissionConfig {
    /// When the client is warned that the question is about to expire.
    pub warn_after: Duration,
    /// When an unanswered question is denied.
    pub deny_after: Duration,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            warn_after: Duration::from_secs(45),
            deny_after: Duration::from_secs(60),
        }
    }
}

/// A user's answer.
#[derive(Clone, Debug, PartialEq)]
pub enum PermissionDecision {
    /// `None` echoes the original input back.
    Allow { updated_input: Option<Value> },
    Deny { message: Option<String> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    /// Unknown id, or already answered by a timeout or an abort.
    NotFound,
}

struct PendingRequest {
    operation_id: OperationId,
    runner: Weak<EventRunner>,
    input: Value,
    responder: oneshot::Sender<PermissionOutcome>,
    timers: Vec<AbortHandle>,
}

pub struct PermissionBroker {
    pending: DashMap<RequestId, PendingRequest>,
    config: PermissionConfig,
}

impl PermissionBroker {
    pub fn new(config: PermissionConfig) -> Self {
        Self {
            pending: DashMap::new(),
            config,
        }
    }

    /// Ask the user, through `runner`'s event stream, whether the operation
    /// may use `tool_name`. Resolves on a decision, the deny timeout, or
    /// the operation being aborted.
    pub async fn request(
        self: &Arc<Self>,
        runner: &Arc<EventRunner>,
        tool_name: &str,
        input: Value,
        reason: Option<String>,
    ) -> PermissionOutcome {
        if runner.cancel_token().is_cancelled() {
            return aborted();
        }

        let request_id = RequestId::new();
        let operation_id = runner.operation_id().clone();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                operation_id: operation_id.clone(),
                runner: Arc::downgrade(runner),
                input: input.clone(),
                responder: tx,
                timers: Vec::with_capacity(2),
            },
        );

        let timers = vec![self.spawn_warn_timer(&request_id), self.spawn_deny_timer(&request_id)];
        match self.pending.get_mut(&request_id) {
            Some(mut entry) => entry.timers = timers,
            None => timers.iter().for_each(AbortHandle::abort),
        }

        tracing::info!(
            operation_id = %operation_id,
            request_id = %request_id,
            tool = tool_name,
            "permission requested"
        );
        runner.buffer_event(EventPayload::PermissionRequest {
            request_id,
            tool_name: tool_name.to_string(),
            input,
            reason,
        });

        rx.await.unwrap_or_else(|_| aborted())
    }

    fn spawn_warn_timer(self: &Arc<Self>, request_id: &RequestId) -> AbortHandle {
        let broker = Arc::downgrade(self);
        let request_id = request_id.clone();
        let warn_after = self.config.warn_after;
        let remaining = self.config.deny_after.saturating_sub(warn_after).as_secs();
        tokio::spawn(async move {
            tokio::time::sleep(warn_after).await;
            let Some(broker) = broker.upgrade() else { return };
            let runner = broker
                .pending
                .get(&request_id)
                .and_then(|p| p.runner.upgrade());
            if let Some(runner) = runner {
                tracing::debug!(request_id = %request_id, "permission request about to expire");
                runner.buffer_event(EventPayload::PermissionWarning {
                    request_id,
                    seconds_remaining: remaining,
                });
            }
        })
        .abort_handle()
    }

    fn spawn_deny_timer(self: &Arc<Self>, request_id: &RequestId) -> AbortHandle {
        let broker = Arc::downgrade(self);
        let request_id = request_id.clone();
        let deny_after = self.config.deny_after;
        tokio::spawn(async move {
            tokio::time::sleep(deny_after).await;
            let Some(broker) = broker.upgrade() else { return };
            if broker.settle(&request_id, deny(TIMED_OUT_MESSAGE, false))
                == ResolveOutcome::Resolved
            {
                tracing::info!(request_id = %request_id, "permission request timed out");
            }
        })
        .abort_handle()
    }

    /// Apply a user decision.
    pub fn resolve(&self, request_id: &RequestId, decision: PermissionDecision) -> ResolveOutcome {
        let outcome = match decision {
            PermissionDecision::Allow {
                updated_input: Some(input),
            } => PermissionOutcome::Allow {
                updated_input: input,
            },
            PermissionDecision::Allow {
                updated_input: None,
            } => match self.pending.get(request_id) {
                Some(entry) => PermissionOutcome::Allow {
                    updated_input: entry.input.clone(),
                },
                None => return ResolveOutcome::NotFound,
            },
            PermissionDecision::Deny { message } => {
                deny(message.as_deref().unwrap_or(DENIED_MESSAGE), false)
            }
        };
        let allowed = outcome.is_allow();
        let result = self.settle(request_id, outcome);
        if result == ResolveOutcome::Resolved {
            tracing::info!(request_id = %request_id, allowed, "permission resolved");
        }
        result
    }

    /// Deny every pending question of `operation_id`. Returns how many.
    pub fn cancel_for_operation(&self, operation_id: &OperationId) -> usize {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|e| &e.operation_id == operation_id)
            .map(|e| e.key().clone())
            .collect();

        ids.iter()
            .filter(|id| self.settle(id, aborted()) == ResolveOutcome::Resolved)
            .count()
    }

    /// The only way an entry leaves the table.
    fn settle(&self, request_id: &RequestId, outcome: PermissionOutcome) -> ResolveOutcome {
        let Some((_, pending)) = self.pending.remove(request_id) else {
            return ResolveOutcome::NotFound;
        };
        for timer in &pending.timers {
            timer.abort();
        }

        if let Some(runner) = pending.runner.upgrade() {
            let message = match &outcome {
                PermissionOutcome::Allow { .. } => None,
                PermissionOutcome::Deny { message, .. } => Some(message.clone()),
            };
            runner.buffer_event(EventPayload::PermissionResolved {
                request_id: request_id.clone(),
                allowed: outcome.is_allow(),
                message,
            });
        }

        let _ = pending.responder.send(outcome);
        ResolveOutcome::Resolved
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_for(&self, operation_id: &OperationId) -> usize {
        self.pending
            .iter()
            .filter(|e| &e.operation_id == operation_id)
            .count()
    }
}

fn deny(message: &str, interrupt: bool) -> PermissionOutcome {
    PermissionOutcome::Deny {
        message: message.to_string(),
        interrupt,
    }
}

fn aborted() -> PermissionOutcome {
    deny(ABORTED_MESSAGE, true)
}

/// Gate handed to the agent for one operation: applies the session's
/// permission mode, and asks the broker for anything it does not cover.
pub struct BrokerGate {
    broker: Arc<PermissionBroker>,
    runner: Arc<EventRunner>,
    mode: PermissionMode,
}

impl BrokerGate {
    pub fn new(broker: Arc<PermissionBroker>, runner: Arc<EventRunner>, mode: PermissionMode) -> Self {
        Self {
            broker,
            runner,
            mode,
        }
    }
}

#[async_trait]
impl PermissionGate for BrokerGate {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        input: Value,
        reason: Option<String>,
    ) -> PermissionOutcome {
        if self.mode.auto_allows(tool_name) {
            return PermissionOutcome::Allow {
                updated_input: input,
            };
        }
        self.broker
            .request(&self.runner, tool_name, input, reason)
            .await
    }
}
