use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::agent::{InitInfo, ResultSummary};
use tether_core::permission::PermissionMode;

/// Per-conversation state kept across operations.
///
/// The init-derived fields at the bottom are large and come back with the
/// agent's next `system/init` message, so they never reach disk; see
/// [`PersistedSession`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub model: String,
    pub permission_mode: PermissionMode,
    pub total_cost_usd: f64,
    pub message_count: u64,
    pub context_tokens: u64,
    pub context_window: Option<u64>,
    pub last_activity: DateTime<Utc>,
    /// One opaque marker per completed turn, oldest first.
    pub checkpoints: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_init: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supported_models: Vec<Value>,
}

impl SessionState {
    pub fn new(default_model: &str) -> Self {
        Self {
            model: default_model.to_string(),
            permission_mode: PermissionMode::Default,
            total_cost_usd: 0.0,
            message_count: 0,
            context_tokens: 0,
            context_window: None,
            last_activity: Utc::now(),
            checkpoints: Vec::new(),
            last_init: None,
            tools: Vec::new(),
            mcp_servers: Vec::new(),
            supported_models: Vec::new(),
        }
    }

    /// Accumulate cost. Negative or non-finite amounts are ignored so the
    /// total never decreases.
    pub fn add_cost(&mut self, cost_usd: f64) {
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.total_cost_usd += cost_usd;
        }
    }

    /// Record the agent's init metadata.
    pub fn apply_init(&mut self, init: &InitInfo, raw: &Value) {
        if let Some(model) = &init.model {
            self.model = model.clone();
        }
        self.tools = init.tools.clone();
        self.mcp_servers = init.mcp_servers.clone();
        if !init.supported_models.is_empty() {
            self.supported_models = init.supported_models.clone();
        }
        self.last_init = Some(raw.clone());
    }

    /// Record one completed turn.
    pub fn record_turn(&mut self, summary: &ResultSummary, checkpoint: impl Into<String>) {
        self.add_cost(summary.total_cost_usd);
        self.message_count += 1;
        if let Some(tokens) = summary.context_tokens {
            self.context_tokens = tokens;
        }
        if summary.context_window.is_some() {
            self.context_window = summary.context_window;
        }
        self.checkpoints.push(checkpoint.into());
    }

    /// Drop the checkpoint at `index` and everything after it, returning the
    /// marker that was at `index`. `None` (and no change) if out of range.
    pub fn rewind_to(&mut self, index: usize) -> Option<String> {
        let target = self.checkpoints.get(index)?.clone();
        self.checkpoints.truncate(index);
        Some(target)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.last_activity > ttl,
            Err(_) => false,
        }
    }
}

/// The subset of [`SessionState`] written to disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub model: String,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub context_tokens: u64,
    #[serde(default)]
    pub context_window: Option<u64>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub checkpoints: Vec<String>,
}

impl From<&SessionState> for PersistedSession {
    fn from(state: &SessionState) -> Self {
        Self {
            model: state.model.clone(),
            permission_mode: state.permission_mode,
            total_cost_usd: state.total_cost_usd,
            message_count: state.message_count,
            context_tokens: state.context_tokens,
            context_window: state.context_window,
            last_activity: state.last_activity,
            checkpoints: state.checkpoints.clone(),
        }
    }
}

impl From<PersistedSession> for SessionState {
    fn from(p: PersistedSession) -> Self {
        Self {
            model: p.model,
            permission_mode: p.permission_mode,
            total_cost_usd: p.total_cost_usd,
            message_count: p.message_count,
            context_tokens: p.context_tokens,
            context_window: p.context_window,
            last_activity: p.last_activity,
            checkpoints: p.checkpoints,
            last_init: None,
            tools: Vec::new(),
            mcp_servers: Vec::new(),
            supported_models: Vec::new(),
        }
    }
}
