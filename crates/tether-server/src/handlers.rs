//! HTTP handlers.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use tether_core::ids::{OperationId, RequestId, SessionId};
use tether_core::permission::PermissionMode;
use tether_engine::{
    AbortMode, AbortOutcome, CommandParams, PermissionDecision, QueryParams, ResolveOutcome,
    SessionUpdate,
};
use tether_store::SessionState;

use crate::error::ApiError;
use crate::server::AppState;
use crate::sse::{into_sse, runner_stream, StreamMode};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBody {
    pub prompt: String,
    pub cwd: PathBuf,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandBody {
    pub command: String,
    pub cwd: PathBuf,
}

/// Identifies an operation by operation id, or by session id as fallback.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupQuery {
    pub session_id: Option<String>,
    pub operation_id: Option<String>,
    /// Last index the client has seen; negative or absent means none.
    pub last_index: Option<i64>,
}

impl LookupQuery {
    fn ids(&self) -> Result<(Option<SessionId>, Option<OperationId>), ApiError> {
        let session = non_empty(&self.session_id).map(SessionId::from_raw);
        let operation = non_empty(&self.operation_id).map(OperationId::from_raw);
        if session.is_none() && operation.is_none() {
            return Err(ApiError::bad_request("sessionId or operationId is required"));
        }
        Ok((session, operation))
    }

    fn resume_from(&self) -> u64 {
        match self.last_index {
            Some(last) if last >= 0 => last as u64 + 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortBody {
    pub operation_id: String,
    #[serde(default)]
    pub hard: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionBody {
    pub request_id: String,
    pub decision: String,
    pub updated_input: Option<Value>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RewindBody {
    pub index: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    pub model: Option<String>,
    pub permission_mode: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_mode(raw: Option<&str>) -> Result<Option<PermissionMode>, ApiError> {
    raw.map(|m| m.parse::<PermissionMode>())
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))
}

pub async fn start_query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<Response, ApiError> {
    let params = QueryParams {
        prompt: body.prompt,
        cwd: body.cwd,
        session_id: non_empty(&body.session_id).map(SessionId::from_raw),
        model: non_empty(&body.model).map(String::from),
        permission_mode: parse_mode(body.permission_mode.as_deref())?,
    };
    let runner = state.orchestrator.start_query(params)?;
    let stream = runner_stream(runner, 0, state.config.max_send_queue, StreamMode::Initial);
    Ok(into_sse(stream, state.config.keepalive_interval).into_response())
}

pub async fn start_command(
    State(state): State<AppState>,
    Json(body): Json<CommandBody>,
) -> Result<Response, ApiError> {
    let runner = state.orchestrator.start_command(CommandParams {
        command: body.command,
        cwd: body.cwd,
    })?;
    let stream = runner_stream(runner, 0, state.config.max_send_queue, StreamMode::Initial);
    Ok(into_sse(stream, state.config.keepalive_interval).into_response())
}

pub async fn reconnect(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> Result<Response, ApiError> {
    let (session, operation) = query.ids()?;
    let runner = state
        .orchestrator
        .find(session.as_ref(), operation.as_ref())
        .ok_or_else(|| ApiError::not_found("operation not found or expired"))?;

    let from = query.resume_from();
    let published = runner.event_count();
    if from > published {
        return Err(ApiError::bad_request(format!(
            "lastIndex {} is beyond the {published} events published so far",
            from - 1
        )));
    }
    tracing::info!(
        operation_id = %runner.operation_id(),
        from,
        running = runner.is_running(),
        "client reconnected"
    );
    let stream = runner_stream(runner, from, state.config.max_send_queue, StreamMode::Reconnect);
    Ok(into_sse(stream, state.config.keepalive_interval).into_response())
}

pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<Value>, ApiError> {
    let (session, operation) = query.ids()?;
    let body = match state.orchestrator.status(session.as_ref(), operation.as_ref()) {
        Some(status) => serde_json::to_value(status).map_err(|e| ApiError::Internal(e.to_string()))?,
        None => json!({
            "active": false,
            "status": null,
            "eventCount": 0,
            "operationId": operation,
            "sessionId": session,
        }),
    };
    Ok(Json(body))
}

pub async fn abort(
    State(state): State<AppState>,
    Json(body): Json<AbortBody>,
) -> Result<Json<Value>, ApiError> {
    if body.operation_id.trim().is_empty() {
        return Err(ApiError::bad_request("operationId is required"));
    }
    let mode = if body.hard {
        AbortMode::Hard
    } else {
        AbortMode::Graceful
    };
    let operation_id = OperationId::from_raw(body.operation_id);
    match state.orchestrator.abort(&operation_id, mode).await {
        AbortOutcome::NotFound => Err(ApiError::not_found(
            "operation not found or already finished",
        )),
        outcome => Ok(Json(json!({ "accepted": true, "outcome": outcome }))),
    }
}

pub async fn resolve_permission(
    State(state): State<AppState>,
    Json(body): Json<PermissionBody>,
) -> Result<Json<Value>, ApiError> {
    let decision = match body.decision.as_str() {
        "allow" => PermissionDecision::Allow {
            updated_input: body.updated_input,
        },
        "deny" => PermissionDecision::Deny {
            message: body.message,
        },
        other => {
            return Err(ApiError::bad_request(format!(
                "decision must be \"allow\" or \"deny\", got {other:?}"
            )))
        }
    };
    let request_id = RequestId::from_raw(body.request_id);
    match state.orchestrator.resolve_permission(&request_id, decision) {
        ResolveOutcome::Resolved => Ok(Json(json!({ "resolved": true }))),
        ResolveOutcome::NotFound => Err(ApiError::not_found(
            "permission request not found or already resolved",
        )),
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
    state
        .orchestrator
        .session(&SessionId::from_raw(id))
        .map(Json)
        .ok_or_else(|| ApiError::not_found("session not found"))
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.orchestrator.clear_session(&SessionId::from_raw(id));
    StatusCode::NO_CONTENT
}

pub async fn rewind_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RewindBody>,
) -> Result<Json<Value>, ApiError> {
    let target = state
        .orchestrator
        .rewind_session(&SessionId::from_raw(id), body.index)?;
    Ok(Json(json!({ "checkpoint": target, "index": body.index })))
}

pub async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SessionPatch>,
) -> Result<Json<SessionState>, ApiError> {
    let update = SessionUpdate {
        model: non_empty(&body.model).map(String::from),
        permission_mode: parse_mode(body.permission_mode.as_deref())?,
    };
    Ok(Json(
        state
            .orchestrator
            .update_session(&SessionId::from_raw(id), update),
    ))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let orchestrator = &state.orchestrator;
    Json(json!({
        "status": "healthy",
        "runners": orchestrator.registry().len(),
        "pendingPermissions": orchestrator.broker().pending_count(),
        "sessions": orchestrator.store().len(),
    }))
}
