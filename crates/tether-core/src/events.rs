use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::AgentMessage;
use crate::ids::{OperationId, RequestId, SessionId};

/// What kind of operation a runner is driving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Command,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Command => "command",
        }
    }
}

/// Lifecycle of one operation. Terminal once it leaves `Running`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every event kind a runner can carry.
///
/// Dispatch on this enum is exhaustive; the only opaque part is the body of
/// an [`AgentMessage`], which was validated at the boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    /// First event of every operation.
    Operation {
        operation_id: OperationId,
        session_id: SessionId,
        kind: OperationKind,
    },
    Agent(AgentMessage),
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    PermissionRequest {
        request_id: RequestId,
        tool_name: String,
        input: Value,
        reason: Option<String>,
    },
    PermissionWarning {
        request_id: RequestId,
        seconds_remaining: u64,
    },
    PermissionResolved {
        request_id: RequestId,
        allowed: bool,
        message: Option<String>,
    },
    Interrupting,
    Error {
        message: String,
    },
    /// Last event of every operation.
    Done {
        status: RunStatus,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Operation { .. } => "operation",
            Self::Agent(msg) => msg.kind.as_str(),
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::Exit { .. } => "exit",
            Self::PermissionRequest { .. } => "permission_request",
            Self::PermissionWarning { .. } => "permission_timeout_warning",
            Self::PermissionResolved { .. } => "permission_resolved",
            Self::Interrupting => "interrupting",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// The `data` object sent to clients.
    pub fn data(&self) -> Value {
        match self {
            Self::Operation {
                operation_id,
                session_id,
                kind,
            } => json!({
                "operationId": operation_id,
                "sessionId": session_id,
                "kind": kind,
            }),
            Self::Agent(msg) => msg.body.clone(),
            Self::Stdout { data } | Self::Stderr { data } => json!({ "data": data }),
            Self::Exit { code, signal } => json!({ "code": code, "signal": signal }),
            Self::PermissionRequest {
                request_id,
                tool_name,
                input,
                reason,
            } => json!({
                "requestId": request_id,
                "toolName": tool_name,
                "input": input,
                "reason": reason,
            }),
            Self::PermissionWarning {
                request_id,
                seconds_remaining,
            } => json!({
                "requestId": request_id,
                "secondsRemaining": seconds_remaining,
            }),
            Self::PermissionResolved {
                request_id,
                allowed,
                message,
            } => json!({
                "requestId": request_id,
                "allowed": allowed,
                "message": message,
            }),
            Self::Interrupting => json!({}),
            Self::Error { message } => json!({ "message": message }),
            Self::Done { status } => json!({ "status": status }),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// One entry in a runner's log.
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerEvent {
    pub index: u64,
    pub payload: EventPayload,
}

impl RunnerEvent {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}
