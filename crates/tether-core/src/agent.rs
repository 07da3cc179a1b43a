//! Boundary parsing for the agent collaborator's messages.
//!
//! The agent emits loosely-typed JSON objects. They are validated once here
//! (the `type` tag must be one we know) and then carried as an
//! [`AgentMessage`] whose body stays opaque to the rest of the system.

use serde_json::Value;

use crate::errors::CoreError;

/// Known top-level message kinds produced by the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AgentMessageKind {
    System,
    Assistant,
    User,
    Result,
    StreamEvent,
}

impl AgentMessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::Result => "result",
            Self::StreamEvent => "stream_event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "assistant" => Some(Self::Assistant),
            "user" => Some(Self::User),
            "result" => Some(Self::Result),
            "stream_event" => Some(Self::StreamEvent),
            _ => None,
        }
    }
}

/// One validated agent message.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentMessage {
    pub kind: AgentMessageKind,
    pub body: Value,
}

/// Metadata carried by the agent's `system/init` message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitInfo {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub tools: Vec<Value>,
    pub mcp_servers: Vec<Value>,
    pub supported_models: Vec<Value>,
}

/// Accounting carried by the agent's `result` message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSummary {
    pub is_error: bool,
    pub total_cost_usd: f64,
    pub context_tokens: Option<u64>,
    pub context_window: Option<u64>,
}

impl AgentMessage {
    pub fn new(kind: AgentMessageKind, body: Value) -> Self {
        Self { kind, body }
    }

    /// Validate a raw collaborator value.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let tag = value
            .as_object()
            .ok_or(CoreError::NotAnObject)?
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CoreError::MissingType)?;
        let kind = AgentMessageKind::parse(tag)
            .ok_or_else(|| CoreError::UnknownMessageType(tag.to_string()))?;
        Ok(Self { kind, body: value })
    }

    pub fn subtype(&self) -> Option<&str> {
        self.body.get("subtype").and_then(Value::as_str)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.body.get("session_id").and_then(Value::as_str)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.body.get("uuid").and_then(Value::as_str)
    }

    /// `Some` only for `system` messages with subtype `init`.
    pub fn init_info(&self) -> Option<InitInfo> {
        if self.kind != AgentMessageKind::System || self.subtype() != Some("init") {
            return None;
        }
        let list = |key: &str| {
            self.body
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        let text = |key: &str| self.body.get(key).and_then(Value::as_str).map(String::from);
        Some(InitInfo {
            session_id: text("session_id"),
            model: text("model"),
            permission_mode: text("permissionMode"),
            tools: list("tools"),
            mcp_servers: list("mcp_servers"),
            supported_models: list("supported_models"),
        })
    }

    /// `Some` only for `result` messages.
    pub fn result_summary(&self) -> Option<ResultSummary> {
        if self.kind != AgentMessageKind::Result {
            return None;
        }
        let usage = self.body.get("usage");
        let token = |key: &str| usage.and_then(|u| u.get(key)).and_then(Value::as_u64);
        let context_tokens = match (
            token("input_tokens"),
            token("cache_read_input_tokens"),
            token("cache_creation_input_tokens"),
        ) {
            (None, None, None) => None,
            (a, b, c) => Some(
                a.unwrap_or(0)
                    .saturating_add(b.unwrap_or(0))
                    .saturating_add(c.unwrap_or(0)),
            ),
        };
        let context_window = self
            .body
            .get("modelUsage")
            .and_then(Value::as_object)
            .and_then(|models| {
                models
                    .values()
                    .find_map(|m| m.get("contextWindow").and_then(Value::as_u64))
            });
        Some(ResultSummary {
            is_error: self
                .body
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            total_cost_usd: self
                .body
                .get("total_cost_usd")
                .and_then(Value::as_f64)
                .filter(|c| c.is_finite() && *c >= 0.0)
                .unwrap_or(0.0),
            context_tokens,
            context_window,
        })
    }
}
