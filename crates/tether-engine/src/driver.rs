//! Operation drivers: consume a collaborator's output into a runner.
//!
//! Both drivers emit the `operation` event first (done by the caller before
//! spawning) and `done` last, then start the registry's retention clock.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tracing::instrument;

use tether_core::agent::{AgentMessage, AgentMessageKind};
use tether_core::events::{EventPayload, RunStatus};
use tether_store::SessionStore;

use crate::backend::{AgentBackend, PermissionGate, ProcessLauncher, ProcessOutput, QueryRequest};
use crate::permission::PermissionBroker;
use crate::registry::RunnerRegistry;
use crate::runner::EventRunner;

/// Shared handles a driver needs.
#[derive(Clone)]
pub(crate) struct DriverContext {
    pub registry: Arc<RunnerRegistry>,
    pub broker: Arc<PermissionBroker>,
    pub store: Arc<SessionStore>,
    pub default_model: String,
}

impl DriverContext {
    /// Record the final status and emit `done`.
    fn finish(&self, runner: &EventRunner, status: RunStatus, error: Option<String>) {
        if let Some(message) = error {
            runner.buffer_event(EventPayload::Error { message });
        }
        runner.set_status(status);
        // Questions nobody can answer any more.
        self.broker.cancel_for_operation(runner.operation_id());

        let status = runner.status();
        runner.buffer_event(EventPayload::Done { status });
        self.registry.mark_completed(runner.operation_id());
        tracing::info!(
            operation_id = %runner.operation_id(),
            session_id = %runner.session_id(),
            %status,
            events = runner.event_count(),
            "operation finished"
        );
    }

    /// Bookkeeping for one agent message, before it is published.
    fn record(&self, runner: &EventRunner, message: &AgentMessage, turn: &mut TurnState) {
        match message.kind {
            AgentMessageKind::System => {
                let Some(init) = message.init_info() else {
                    return;
                };
                if let Some(agent_session) = init.session_id.as_deref() {
                    let old = runner.session_id();
                    let new = tether_core::ids::SessionId::from_raw(agent_session);
                    if old != new {
                        self.registry
                            .rebind_session_id(runner.operation_id(), &old, &new);
                        self.store.rename(&old, &new);
                    }
                }
                self.store
                    .update(&runner.session_id(), &self.default_model, |state| {
                        state.apply_init(&init, &message.body)
                    });
            }
            AgentMessageKind::User => {
                if turn.first_user_uuid.is_none() {
                    turn.first_user_uuid = message.uuid().map(String::from);
                }
            }
            AgentMessageKind::Result => {
                let Some(summary) = message.result_summary() else {
                    return;
                };
                turn.failed |= summary.is_error;
                let checkpoint = turn
                    .first_user_uuid
                    .take()
                    .unwrap_or_else(|| runner.operation_id().to_string());
                self.store
                    .update(&runner.session_id(), &self.default_model, |state| {
                        state.record_turn(&summary, checkpoint)
                    });
            }
            AgentMessageKind::Assistant | AgentMessageKind::StreamEvent => {}
        }
    }
}

#[derive(Default)]
struct TurnState {
    first_user_uuid: Option<String>,
    failed: bool,
}

#[instrument(skip_all, fields(operation_id = %runner.operation_id()))]
pub(crate) async fn drive_query(
    ctx: DriverContext,
    runner: Arc<EventRunner>,
    backend: Arc<dyn AgentBackend>,
    gate: Arc<dyn PermissionGate>,
    request: QueryRequest,
) {
    let run = match backend
        .start(request, gate, runner.cancel_token().clone())
        .await
    {
        Ok(run) => run,
        Err(e) => {
            tracing::error!(error = %e, "agent failed to start");
            ctx.finish(&runner, RunStatus::Error, Some(e.to_string()));
            return;
        }
    };
    runner.set_interrupter(run.interrupter);

    let mut messages = run.messages;
    let mut turn = TurnState::default();
    let mut failure = None;

    while let Some(item) = messages.next().await {
        let value = match item {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "agent stream failed");
                failure = Some(e.to_string());
                break;
            }
        };
        let message = match AgentMessage::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unrecognized agent message");
                continue;
            }
        };
        ctx.record(&runner, &message, &mut turn);
        runner.buffer_event(EventPayload::Agent(message));
    }
    drop(messages);
    runner.set_interrupter(None);

    let status = if runner.cancel_token().is_cancelled() || runner.is_interrupting() {
        RunStatus::Aborted
    } else if failure.is_some() || turn.failed {
        RunStatus::Error
    } else {
        RunStatus::Completed
    };
    ctx.finish(&runner, status, failure);
}

#[instrument(skip_all, fields(operation_id = %runner.operation_id()))]
pub(crate) async fn drive_command(
    ctx: DriverContext,
    runner: Arc<EventRunner>,
    launcher: Arc<dyn ProcessLauncher>,
    command: String,
    cwd: PathBuf,
) {
    let mut output = match launcher
        .launch(&command, &cwd, runner.cancel_token().clone())
        .await
    {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(error = %e, "command failed to start");
            ctx.finish(&runner, RunStatus::Error, Some(e.to_string()));
            return;
        }
    };

    let mut exit_code = None;
    while let Some(item) = output.next().await {
        let payload = match item {
            ProcessOutput::Stdout(data) => EventPayload::Stdout { data },
            ProcessOutput::Stderr(data) => EventPayload::Stderr { data },
            ProcessOutput::Exit { code, signal } => {
                exit_code = code;
                EventPayload::Exit { code, signal }
            }
        };
        runner.buffer_event(payload);
    }

    let status = if runner.cancel_token().is_cancelled() {
        RunStatus::Aborted
    } else if exit_code == Some(0) {
        RunStatus::Completed
    } else {
        RunStatus::Error
    };
    ctx.finish(&runner, status, None);
}
