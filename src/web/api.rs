use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use super::AppState;
use crate::errors::AppError;
use crate::models::*;

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

fn error_status(e: &AppError) -> StatusCode {
    match e {
        AppError::NotFound { .. } => StatusCode::NOT_FOUND,
        AppError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::Supervisor(crate::errors::SupervisorError::InvalidState { .. }) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(e: &AppError) -> Json<Value> {
    Json(json!({ "error": e.to_string() }))
}

// Jobs

pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, StatusCode> {
    match state.database.list_jobs().await {
        Ok(jobs) => Ok(Json(jobs)),
        Err(e) => {
            error!("Failed to list jobs: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<JobCreateRequest>,
) -> Result<Json<Job>, (StatusCode, Json<Value>)> {
    if let Err(message) = validate_targets(&payload.targets) {
        let e = AppError::validation(message);
        return Err((error_status(&e), error_body(&e)));
    }

    match state.database.create_job(&payload).await {
        Ok(job) => Ok(Json(job)),
        Err(e) => {
            error!("Failed to create job: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "job creation failed" })),
            ))
        }
    }
}

pub async fn get_job(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Job>, StatusCode> {
    match state.database.get_job(id).await {
        Ok(Some(job)) => Ok(Json(job)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to get job {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn update_job(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<JobUpdateRequest>,
) -> Result<Json<Job>, (StatusCode, Json<Value>)> {
    if let Err(message) = validate_targets(&payload.targets) {
        let e = AppError::validation(message);
        return Err((error_status(&e), error_body(&e)));
    }

    match state.database.update_job(id, &payload).await {
        Ok(Some(job)) => Ok(Json(job)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "job not found" })),
        )),
        Err(e) => {
            error!("Failed to update job {}: {}", id, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "job update failed" })),
            ))
        }
    }
}

pub async fn delete_job(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, StatusCode> {
    match state.database.delete_job(id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to delete job {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// Runs

/// Trigger an immediate run of a job's current targets.
pub async fn trigger_job_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Run>), (StatusCode, Json<Value>)> {
    let job = match state.database.get_job(id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "job not found" })),
            ))
        }
        Err(e) => {
            error!("Failed to load job {} for trigger: {}", id, e);
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "trigger failed" })),
            ));
        }
    };

    match state.supervisor.trigger_run(Some(job.id), job.targets).await {
        Ok(run) => Ok((StatusCode::ACCEPTED, Json(run))),
        Err(e) => {
            error!("Failed to trigger run for job {}: {}", id, e);
            Err((error_status(&e), error_body(&e)))
        }
    }
}

/// Trigger an ad-hoc run from a target list payload.
pub async fn trigger_run(
    State(state): State<AppState>,
    Json(payload): Json<RunTriggerRequest>,
) -> Result<(StatusCode, Json<Run>), (StatusCode, Json<Value>)> {
    match state.supervisor.trigger_run(None, payload.targets).await {
        Ok(run) => Ok((StatusCode::ACCEPTED, Json(run))),
        Err(e) => {
            error!("Failed to trigger ad-hoc run: {}", e);
            Err((error_status(&e), error_body(&e)))
        }
    }
}

pub async fn list_runs(
    Query(query): Query<RunListQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Run>>, StatusCode> {
    let limit = query.limit.unwrap_or(50).min(500);
    match state.database.list_runs(limit).await {
        Ok(runs) => Ok(Json(runs)),
        Err(e) => {
            error!("Failed to list runs: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn get_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Run>, StatusCode> {
    match state.database.get_run(id).await {
        Ok(Some(run)) => Ok(Json(run)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to get run {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn stop_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    match state.supervisor.stop_run(id).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(e) => {
            error!("Failed to stop run {}: {}", id, e);
            Err((error_status(&e), error_body(&e)))
        }
    }
}

pub async fn resume_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Run>), (StatusCode, Json<Value>)> {
    match state.supervisor.resume_run(id).await {
        Ok(run) => Ok((StatusCode::ACCEPTED, Json(run))),
        Err(e) => {
            error!("Failed to resume run {}: {}", id, e);
            Err((error_status(&e), error_body(&e)))
        }
    }
}

pub async fn delete_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    match state.supervisor.delete_run(id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "run not found" })),
        )),
        Err(e) => {
            error!("Failed to delete run {}: {}", id, e);
            Err((error_status(&e), error_body(&e)))
        }
    }
}

pub async fn get_run_log(
    Path(id): Path<Uuid>,
    Query(query): Query<LogTailQuery>,
    State(state): State<AppState>,
) -> Json<LogTailResponse> {
    let lines = query.lines.unwrap_or(100).min(1000);
    Json(LogTailResponse {
        run_id: id,
        lines: state.supervisor.log_tail(id, lines).await,
    })
}

// Progress

/// Current progress document for the most recently active run.
pub async fn get_progress(State(state): State<AppState>) -> Json<Value> {
    Json(Value::Object(state.progress.snapshot().await))
}

fn validate_targets(targets: &[Target]) -> Result<(), String> {
    if targets.is_empty() {
        return Err("at least one target is required".to_string());
    }
    for target in targets {
        url::Url::parse(&target.base_url)
            .map_err(|e| format!("invalid base_url '{}': {e}", target.base_url))?;
        target.recipe.validate()?;
    }
    Ok(())
}
