use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::types::RunStatus;
use crate::limiter::RateLimitConfig;
use crate::session::{Phase, SessionEvent};
use crate::tools::ToolRegistry;
use crate::workflows;

use super::errors::AppError;
use super::AppState;

// --- Request/Response types ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub workflow_key: Option<String>,
    #[serde(default)]
    pub intent_id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub run_id: String,
    pub status: String,
    pub steps_enqueued: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub week: Option<u32>,
    #[serde(default)]
    pub day: Option<u32>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub etag_if_none_match: Option<String>,
}

#[derive(Serialize)]
pub struct SessionEventResponse {
    pub ok: bool,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /dispatch
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, AppError> {
    let user_id = req
        .user_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("'userId' is required".to_string()))?;
    let workflow_key = req
        .workflow_key
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("'workflowKey' is required".to_string()))?;

    let receipt = state
        .dispatcher
        .dispatch(
            &user_id,
            &workflow_key,
            req.intent_id,
            req.payload.unwrap_or(Value::Null),
        )
        .await?;

    Ok(Json(DispatchResponse {
        run_id: receipt.run_id,
        status: receipt.status.to_string(),
        steps_enqueued: receipt.steps_enqueued,
    }))
}

/// POST /session/event
pub async fn session_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionEventRequest>,
) -> Result<Json<SessionEventResponse>, AppError> {
    let user_id = req
        .user_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("'userId' is required".to_string()))?;
    let event_name = req
        .event
        .ok_or_else(|| AppError::BadRequest("'event' is required".to_string()))?;
    let event = SessionEvent::from_str(&event_name)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let reply = state
        .sessions
        .handle_event(
            &user_id,
            req.week.unwrap_or(1),
            req.day.unwrap_or(1),
            event,
            req.payload.unwrap_or(Value::Null),
            req.etag_if_none_match,
        )
        .await?;

    Ok(Json(SessionEventResponse {
        ok: true,
        phase: reply.phase,
        data: reply.data,
    }))
}

/// GET /status?userId=...
///
/// Read-only snapshot: active run and session, per-tool signal freshness,
/// next scheduled workflow, aggregate run stats.
pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatusQuery>,
) -> Result<Json<Value>, AppError> {
    let user_id = &params.user_id;

    let runs = state.store.list_runs(Some(user_id), None).await?;
    let active_run = runs.iter().find(|r| r.status == RunStatus::Running);

    let sessions = state.store.sessions_for_user(user_id).await?;
    let active_session = sessions.iter().find(|s| s.phase != Phase::Completed);

    let mut signals = Vec::new();
    for descriptor in state.registry.list() {
        let key = ToolRegistry::limit_key(user_id, descriptor.name);
        let bucket = state
            .limiter
            .status(&key, RateLimitConfig::per_minute(descriptor.per_minute))
            .await?;
        signals.push(serde_json::json!({
            "tool": descriptor.name,
            "version": descriptor.version,
            "tokens": bucket.tokens,
            "capacity": bucket.capacity,
        }));
    }

    let next_scheduled = workflows::builtin_keys()
        .into_iter()
        .filter_map(workflows::builtin)
        .find_map(|spec| match spec.trigger {
            crate::engine::types::Trigger::Cron(expr) => Some(serde_json::json!({
                "workflowKey": spec.key,
                "cron": expr,
            })),
            _ => None,
        });

    let completed = runs
        .iter()
        .filter(|r| r.status == RunStatus::Completed)
        .count();
    let failed = runs.iter().filter(|r| r.status == RunStatus::Failed).count();

    Ok(Json(serde_json::json!({
        "activeRun": active_run.map(|r| serde_json::json!({
            "runId": r.run_id,
            "workflowKey": r.workflow_key,
            "started": r.started,
        })),
        "activeSession": active_session.map(|s| serde_json::json!({
            "week": s.week,
            "day": s.day,
            "phase": s.phase,
            "updatedAt": s.updated_at,
        })),
        "signals": signals,
        "nextScheduledRun": next_scheduled,
        "stats": {
            "totalRuns": runs.len(),
            "completed": completed,
            "failed": failed,
            "sessions": sessions.len(),
        },
    })))
}

/// GET /runs
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListRunsQuery>,
) -> Result<Json<Value>, AppError> {
    let status_filter = params
        .status
        .as_deref()
        .map(parse_status)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let runs = state
        .store
        .list_runs(params.user_id.as_deref(), status_filter)
        .await?;

    let summaries: Vec<Value> = runs
        .iter()
        .map(|r| {
            serde_json::json!({
                "runId": r.run_id,
                "workflowKey": r.workflow_key,
                "userId": r.user_id,
                "status": r.status,
                "started": r.started,
                "finished": r.finished,
                "stepCount": r.steps.len(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "runs": summaries,
        "total": summaries.len(),
    })))
}

/// GET /runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let run = state
        .store
        .get_run(&id)
        .await
        .map_err(|_| AppError::NotFound(format!("Run '{}' not found", id)))?;
    let jobs = state.store.jobs_for_run(&id).await?;

    Ok(Json(serde_json::json!({
        "run": run,
        "jobs": jobs,
    })))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

fn parse_status(s: &str) -> Result<RunStatus, String> {
    match s {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        _ => Err(format!(
            "Invalid status '{}'. Use: running, completed, failed",
            s
        )),
    }
}
