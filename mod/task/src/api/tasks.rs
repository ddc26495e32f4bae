use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use atelier_core::ServiceError;

use crate::engine::TaskEngine;
use crate::manual::{CompleteKeyReject, CompleteKeyResult};
use crate::model::{
    CompleteKeyRequest, CompleteRequest, FailRequest, ProgressReport, SubmitOutcome,
    SubmitTaskRequest, Task, TaskListQuery,
};

type EngineState = Arc<TaskEngine>;

// ---------------------------------------------------------------------------
// POST /tasks
// ---------------------------------------------------------------------------

pub async fn submit(
    State(engine): State<EngineState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitOutcome>, ServiceError> {
    let outcome = engine.submit(req)?;
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// GET /tasks
// ---------------------------------------------------------------------------

pub async fn list(
    State(engine): State<EngineState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let result = engine.list_tasks(&query)?;
    Ok(Json(serde_json::json!({
        "items": result.items,
        "total": result.total,
    })))
}

// ---------------------------------------------------------------------------
// GET /tasks/:id
// ---------------------------------------------------------------------------

pub async fn get_task(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServiceError> {
    let task = engine.get_task(&id)?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// Worker-facing transitions
// ---------------------------------------------------------------------------

pub async fn start(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServiceError> {
    Ok(Json(engine.start_task(&id)?))
}

pub async fn heartbeat(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    engine.heartbeat(&id)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn progress(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Json(report): Json<ProgressReport>,
) -> Result<Json<Task>, ServiceError> {
    Ok(Json(engine.report_progress(&id, report)?))
}

pub async fn complete(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<Task>, ServiceError> {
    Ok(Json(engine.complete_task(&id, req)?))
}

pub async fn fail(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> Result<Json<Task>, ServiceError> {
    Ok(Json(engine.fail_task(&id, req)?))
}

pub async fn dismiss(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServiceError> {
    Ok(Json(engine.dismiss_task(&id)?))
}

// ---------------------------------------------------------------------------
// POST /tasks/:id/@complete-key — manual completion protocol
// ---------------------------------------------------------------------------

/// Result-object responses rather than thrown errors: the caller retries
/// against `code`, and idempotent retries must look like success.
pub async fn complete_key(
    State(engine): State<EngineState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteKeyRequest>,
) -> impl IntoResponse {
    match engine.complete_manual_key(&id, &req).await {
        Ok(CompleteKeyResult::Accepted {
            done,
            progress,
            already_done,
        }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "done": done,
                "progress": progress,
                "alreadyDone": already_done,
            })),
        )
            .into_response(),
        Ok(CompleteKeyResult::Rejected(reject)) => (
            reject_status(reject),
            Json(serde_json::json!({
                "ok": false,
                "code": reject.code(),
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

fn reject_status(reject: CompleteKeyReject) -> StatusCode {
    match reject {
        CompleteKeyReject::NotFound => StatusCode::NOT_FOUND,
        CompleteKeyReject::Forbidden => StatusCode::FORBIDDEN,
        CompleteKeyReject::TaskNotActive => StatusCode::CONFLICT,
        CompleteKeyReject::InvalidTaskType
        | CompleteKeyReject::InvalidTarget
        | CompleteKeyReject::InvalidPayload
        | CompleteKeyReject::InvalidKey => StatusCode::BAD_REQUEST,
    }
}
