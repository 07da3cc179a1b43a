//! Orchestrator: the engine's public face.
//!
//! Owns the registry, broker, abort coordinator and session store handle,
//! starts queries and commands on their drivers, and answers status, abort,
//! permission and session requests from the server.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use tether_core::events::{EventPayload, OperationKind, RunStatus};
use tether_core::ids::{OperationId, RequestId, SessionId};
use tether_core::permission::PermissionMode;
use tether_store::{SessionState, SessionStore};

use crate::abort::{AbortConfig, AbortCoordinator, AbortMode, AbortOutcome};
use crate::backend::{AgentBackend, PermissionGate, ProcessLauncher, QueryRequest};
use crate::driver::{drive_command, drive_query, DriverContext};
use crate::error::EngineError;
use crate::permission::{
    BrokerGate, PermissionBroker, PermissionConfig, PermissionDecision, ResolveOutcome,
};
use crate::registry::{ReaperConfig, RunnerRegistry};
use crate::runner::EventRunner;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Per-kind buffer caps.
#[derive(Clone, Debug)]
pub struct RunnerLimits {
    pub query_buffer_cap: usize,
    pub command_buffer_cap: usize,
}

impl Default for RunnerLimits {
    fn default() -> Self {
        Self {
            query_buffer_cap: 1000,
            command_buffer_cap: 500,
        }
    }
}

impl RunnerLimits {
    pub fn cap_for(&self, kind: OperationKind) -> usize {
        match kind {
            OperationKind::Query => self.query_buffer_cap,
            OperationKind::Command => self.command_buffer_cap,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub default_model: String,
    pub limits: RunnerLimits,
    pub reaper: ReaperConfig,
    pub permission: PermissionConfig,
    pub abort: AbortConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            limits: RunnerLimits::default(),
            reaper: ReaperConfig::default(),
            permission: PermissionConfig::default(),
            abort: AbortConfig::default(),
        }
    }
}

/// Parameters for starting an agent query.
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    pub prompt: String,
    pub cwd: PathBuf,
    /// Conversation to continue; `None` starts a new one.
    pub session_id: Option<SessionId>,
    pub model: Option<String>,
    pub permission_mode: Option<PermissionMode>,
}

/// Parameters for starting a shell command.
#[derive(Clone, Debug, Default)]
pub struct CommandParams {
    pub command: String,
    pub cwd: PathBuf,
}

/// Snapshot answered by the status endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub active: bool,
    pub status: RunStatus,
    pub event_count: u64,
    pub operation_id: OperationId,
    pub session_id: SessionId,
    pub kind: OperationKind,
}

impl OperationStatus {
    fn of(runner: &EventRunner) -> Self {
        let status = runner.status();
        Self {
            active: !status.is_terminal(),
            status,
            event_count: runner.event_count(),
            operation_id: runner.operation_id().clone(),
            session_id: runner.session_id(),
            kind: runner.kind(),
        }
    }
}

/// Durable session settings a client may change.
#[derive(Clone, Debug, Default)]
pub struct SessionUpdate {
    pub model: Option<String>,
    pub permission_mode: Option<PermissionMode>,
}

pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<RunnerRegistry>,
    broker: Arc<PermissionBroker>,
    aborts: AbortCoordinator,
    store: Arc<SessionStore>,
    backend: Arc<dyn AgentBackend>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        store: Arc<SessionStore>,
        backend: Arc<dyn AgentBackend>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let registry = Arc::new(RunnerRegistry::new(config.reaper.clone()));
        let broker = Arc::new(PermissionBroker::new(config.permission.clone()));
        let aborts = AbortCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&broker),
            config.abort.clone(),
        );
        Self {
            config,
            registry,
            broker,
            aborts,
            store,
            backend,
            launcher,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<PermissionBroker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    fn driver_context(&self) -> DriverContext {
        DriverContext {
            registry: Arc::clone(&self.registry),
            broker: Arc::clone(&self.broker),
            store: Arc::clone(&self.store),
            default_model: self.config.default_model.clone(),
        }
    }

    /// Create, register and announce a runner.
    fn open_runner(
        &self,
        kind: OperationKind,
        session_id: SessionId,
    ) -> Result<Arc<EventRunner>, EngineError> {
        let operation_id = OperationId::new();
        let runner = Arc::new(EventRunner::new(
            operation_id.clone(),
            session_id.clone(),
            kind,
            self.config.limits.cap_for(kind),
        ));
        self.registry.register(Arc::clone(&runner))?;
        runner.buffer_event(EventPayload::Operation {
            operation_id,
            session_id,
            kind,
        });
        Ok(runner)
    }

    /// Start an agent query. The returned runner already holds the
    /// `operation` event; everything after it comes from the driver task.
    pub fn start_query(&self, params: QueryParams) -> Result<Arc<EventRunner>, EngineError> {
        if params.prompt.trim().is_empty() {
            return Err(EngineError::InvalidInput("prompt is required".into()));
        }
        validate_cwd(&params.cwd)?;

        let resume = params.session_id.clone();
        let session_id = resume.clone().unwrap_or_default();
        let mut state = self.store.get(&session_id, &self.config.default_model);
        let overridden = params.model.is_some() || params.permission_mode.is_some();
        if let Some(model) = params.model {
            state.model = model;
        }
        if let Some(mode) = params.permission_mode {
            state.permission_mode = mode;
        }

        let runner = self.open_runner(OperationKind::Query, session_id.clone())?;
        if overridden {
            self.store.save(session_id.clone(), state.clone());
        }

        let request = QueryRequest {
            operation_id: runner.operation_id().clone(),
            resume,
            prompt: params.prompt,
            cwd: params.cwd,
            model: state.model.clone(),
            permission_mode: state.permission_mode,
        };
        let gate: Arc<dyn PermissionGate> = Arc::new(BrokerGate::new(
            Arc::clone(&self.broker),
            Arc::clone(&runner),
            state.permission_mode,
        ));

        tracing::info!(
            operation_id = %runner.operation_id(),
            session_id = %session_id,
            model = %state.model,
            "query started"
        );
        tokio::spawn(drive_query(
            self.driver_context(),
            Arc::clone(&runner),
            Arc::clone(&self.backend),
            gate,
            request,
        ));
        Ok(runner)
    }

    /// Start a shell command under a fresh session id.
    pub fn start_command(&self, params: CommandParams) -> Result<Arc<EventRunner>, EngineError> {
        if params.command.trim().is_empty() {
            return Err(EngineError::InvalidInput("command is required".into()));
        }
        validate_cwd(&params.cwd)?;

        let runner = self.open_runner(OperationKind::Command, SessionId::new())?;
        tracing::info!(operation_id = %runner.operation_id(), "command started");
        tokio::spawn(drive_command(
            self.driver_context(),
            Arc::clone(&runner),
            Arc::clone(&self.launcher),
            params.command,
            params.cwd,
        ));
        Ok(runner)
    }

    pub async fn abort(&self, operation_id: &OperationId, mode: AbortMode) -> AbortOutcome {
        self.aborts.abort(operation_id, mode).await
    }

    pub fn abort_all(&self) -> usize {
        self.aborts.abort_all()
    }

    pub fn resolve_permission(
        &self,
        request_id: &RequestId,
        decision: PermissionDecision,
    ) -> ResolveOutcome {
        self.broker.resolve(request_id, decision)
    }

    /// Look a runner up by operation id, falling back to session id.
    pub fn find(
        &self,
        session_id: Option<&SessionId>,
        operation_id: Option<&OperationId>,
    ) -> Option<Arc<EventRunner>> {
        operation_id
            .and_then(|op| self.registry.get_by_operation(op))
            .or_else(|| session_id.and_then(|s| self.registry.get_by_session(s)))
    }

    pub fn status(
        &self,
        session_id: Option<&SessionId>,
        operation_id: Option<&OperationId>,
    ) -> Option<OperationStatus> {
        self.find(session_id, operation_id)
            .map(|runner| OperationStatus::of(&runner))
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionState> {
        self.store.peek(session_id)
    }

    pub fn clear_session(&self, session_id: &SessionId) -> bool {
        self.store.delete(session_id)
    }

    /// Truncate checkpoints to `[0, index)`, returning the marker at `index`.
    pub fn rewind_session(
        &self,
        session_id: &SessionId,
        index: usize,
    ) -> Result<String, EngineError> {
        if self
            .registry
            .get_by_session(session_id)
            .is_some_and(|r| r.is_running())
        {
            return Err(EngineError::SessionBusy(session_id.to_string()));
        }
        let mut state = self
            .store
            .peek(session_id)
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        let available = state.checkpoints.len();
        let target = state.rewind_to(index).ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "checkpoint index {index} out of range (0..{available})"
            ))
        })?;
        self.store.save(session_id.clone(), state);
        tracing::info!(session_id = %session_id, index, "session rewound");
        Ok(target)
    }

    pub fn update_session(
        &self,
        session_id: &SessionId,
        update: SessionUpdate,
    ) -> SessionState {
        self.store
            .update(session_id, &self.config.default_model, |state| {
                if let Some(model) = update.model {
                    state.model = model;
                }
                if let Some(mode) = update.permission_mode {
                    state.permission_mode = mode;
                }
            })
    }

    pub fn start_reaper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.registry.start_reaper(shutdown)
    }
}

fn validate_cwd(cwd: &std::path::Path) -> Result<(), EngineError> {
    if cwd.as_os_str().is_empty() {
        return Err(EngineError::InvalidInput("cwd is required".into()));
    }
    if !cwd.is_dir() {
        return Err(EngineError::InvalidInput(format!(
            "cwd {} is not a directory",
            cwd.display()
        )));
    }
    Ok(())
}
