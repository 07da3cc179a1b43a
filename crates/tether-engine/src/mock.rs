use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::backend::{AgentBackend, AgentRun, Interrupter, PermissionGate, QueryRequest};
use crate::error::EngineError;

/// One scripted step of a mock agent run.
#[derive(Clone, Debug)]
pub enum MockStep {
    /// Emit a raw agent message.
    Message(Value),
    /// Ask the permission gate, then emit a `user` message carrying the
    /// answer. A deny with `interrupt` ends the run.
    Permission { tool_name: String, input: Value },
    /// Sleep, unless cancelled or interrupted first.
    Delay(Duration),
    /// Emit a stream error and stop.
    Fail(String),
    /// Wait until cancelled or interrupted.
    Hang,
}

impl MockStep {
    pub fn init(session_id: &str) -> Self {
        Self::Message(json!({
            "type": "system",
            "subtype": "init",
            "session_id": session_id,
            "model": "mock-model",
            "permissionMode": "default",
            "tools": ["Bash", "Edit", "Read"],
            "mcp_servers": [],
            "supported_models": [{"value": "mock-model"}],
        }))
    }

    pub fn user(uuid: &str) -> Self {
        Self::Message(json!({
            "type": "user",
            "uuid": uuid,
            "message": {"role": "user", "content": "prompt"},
        }))
    }

    pub fn assistant(text: &str) -> Self {
        Self::Message(json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": [{"type": "text", "text": text}]},
        }))
    }

    pub fn result(cost_usd: f64) -> Self {
        Self::Message(json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "total_cost_usd": cost_usd,
            "usage": {
                "input_tokens": 1200,
                "cache_read_input_tokens": 300,
                "cache_creation_input_tokens": 0,
                "output_tokens": 80,
            },
            "modelUsage": {"mock-model": {"contextWindow": 200000}},
        }))
    }

    pub fn permission(tool_name: &str, input: Value) -> Self {
        Self::Permission {
            tool_name: tool_name.to_string(),
            input,
        }
    }
}

/// A full successful turn: init, the prompt echo, one reply, result.
pub fn scripted_turn(session_id: &str, text: &str, cost_usd: f64) -> Vec<MockStep> {
    vec![
        MockStep::init(session_id),
        MockStep::user(&format!("{session_id}-u1")),
        MockStep::assistant(text),
        MockStep::result(cost_usd),
    ]
}

/// Agent backend that plays pre-programmed scripts, one per `start`.
pub struct MockAgentBackend {
    scripts: Mutex<VecDeque<Vec<MockStep>>>,
    interruptible: bool,
    requests: Mutex<Vec<QueryRequest>>,
}

impl MockAgentBackend {
    pub fn new(scripts: Vec<Vec<MockStep>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            interruptible: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// No cooperative interrupt; graceful stops become hard aborts.
    pub fn without_interrupt(mut self) -> Self {
        self.interruptible = false;
        self
    }

    pub fn push_script(&self, script: Vec<MockStep>) {
        self.scripts.lock().push_back(script);
    }

    /// Every request `start` received, in order.
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }
}

struct MockInterrupter {
    stop: CancellationToken,
}

#[async_trait]
impl Interrupter for MockInterrupter {
    async fn interrupt(&self) -> Result<(), EngineError> {
        self.stop.cancel();
        Ok(())
    }
}

#[async_trait]
impl AgentBackend for MockAgentBackend {
    async fn start(
        &self,
        request: QueryRequest,
        gate: Arc<dyn PermissionGate>,
        cancel: CancellationToken,
    ) -> Result<AgentRun, EngineError> {
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front().ok_or_else(|| {
            EngineError::Spawn("MockAgentBackend: no script configured".into())
        })?;

        let stop = CancellationToken::new();
        let interrupter: Option<Arc<dyn Interrupter>> = if self.interruptible {
            Some(Arc::new(MockInterrupter { stop: stop.clone() }))
        } else {
            None
        };

        let messages = async_stream::stream! {
            for step in script {
                if cancel.is_cancelled() {
                    return;
                }
                if stop.is_cancelled() {
                    break;
                }
                match step {
                    MockStep::Message(value) => yield Ok(value),
                    MockStep::Permission { tool_name, input } => {
                        let outcome = gate.can_use_tool(&tool_name, input, None).await;
                        let stop_now = matches!(
                            outcome,
                            tether_core::permission::PermissionOutcome::Deny { interrupt: true, .. }
                        );
                        yield Ok(json!({
                            "type": "user",
                            "message": {"content": [{
                                "type": "tool_result",
                                "tool_name": tool_name,
                                "permission": outcome,
                            }]},
                        }));
                        if stop_now {
                            return;
                        }
                    }
                    MockStep::Delay(duration) => {
                        tokio::select! {
                            () = tokio::time::sleep(duration) => {}
                            () = cancel.cancelled() => {}
                            () = stop.cancelled() => {}
                        }
                    }
                    MockStep::Fail(message) => {
                        yield Err(EngineError::Collaborator(message));
                        return;
                    }
                    MockStep::Hang => {
                        tokio::select! {
                            () = cancel.cancelled() => {}
                            () = stop.cancelled() => {}
                        }
                    }
                }
            }

            if stop.is_cancelled() && !cancel.is_cancelled() {
                yield Ok(json!({
                    "type": "result",
                    "subtype": "error_during_execution",
                    "is_error": false,
                    "total_cost_usd": 0.0,
                    "interrupted": true,
                }));
            }
        };

        Ok(AgentRun {
            messages: Box::pin(messages),
            interrupter,
        })
    }
}
