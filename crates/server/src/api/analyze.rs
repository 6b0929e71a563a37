use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use super::logs::owned_file;
use crate::auth::AuthUser;
use crate::db::jobs::JobRecord;
use crate::error::{ApiError, ApiResult};
use crate::jobs::scheduler::RcaJobOptions;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub chunking: Option<bool>,
}

/// Jobs are addressed directly; ownership flows through their file.
fn owned_job(state: &AppState, user_id: &str, job_id: &str) -> ApiResult<JobRecord> {
    let job = state.db.job_by_id(job_id)?;
    let file = state.db.file_by_id(&job.file_id)?;
    if file.user_id != user_id {
        return Err(ApiError::NotFound("job not found".to_string()));
    }
    Ok(job)
}

/// POST /logs/{id}/analyze — create an analysis job. The LLM endpoint is
/// health-checked up front: an unreachable endpoint responds 503 and no
/// job row is created.
pub async fn create(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<AnalyzeRequest>,
) -> ApiResult<impl IntoResponse> {
    let file = owned_file(&state, &user.id, &id)?;

    if file.rca_possible == Some(false) {
        return Err(ApiError::InvalidRequest(format!(
            "analysis is not possible for this file: {}",
            file.rca_reason.as_deref().unwrap_or("no errors detected")
        )));
    }

    let endpoint = state.endpoint_for(&user).ok_or_else(|| {
        ApiError::LlmUnavailable("no LLM endpoint configured for this account".to_string())
    })?;
    state.gateway.health(&endpoint).await?;

    let opts = RcaJobOptions {
        timeout_secs: state.config.clamp_call_timeout(body.timeout),
        chunking: body.chunking.unwrap_or(true),
    };
    let job = state.scheduler.create_rca_job(&file.id, opts)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": job }))))
}

/// GET /logs/{id}/rca-results — the latest completed analysis.
pub async fn results(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_file(&state, &user.id, &id)?;
    let memory = state.db.latest_memory_for_file(&id)?;
    Ok(Json(json!({ "analysis": memory })))
}

/// GET /logs/{id}/analyses — all retained analyses, newest first.
pub async fn analyses(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_file(&state, &user.id, &id)?;
    let memories = state.db.memories_for_file(&id)?;
    Ok(Json(json!({ "analyses": memories })))
}

/// GET /logs/{id}/jobs
pub async fn jobs_for_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_file(&state, &user.id, &id)?;
    let jobs = state.db.jobs_for_file(&id)?;
    Ok(Json(json!({ "jobs": jobs })))
}

/// GET /jobs/{id}/status — progress and chunk counters.
pub async fn status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = owned_job(&state, &user.id, &id)?;
    Ok(Json(json!({
        "id": job.id,
        "status": job.status,
        "progress": job.progress,
        "totalChunks": job.total_chunks,
        "currentChunk": job.current_chunk,
        "failedChunk": job.failed_chunk,
        "error": job.error_message,
        "startedAt": job.started_at,
        "completedAt": job.completed_at,
    })))
}

/// POST /jobs/{id}/cancel — cooperative; takes effect at the next chunk
/// boundary for a running job.
pub async fn cancel(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_job(&state, &user.id, &id)?;
    let accepted = state.scheduler.cancel(&id)?;
    Ok(Json(json!({ "cancellationRequested": accepted })))
}

/// POST /jobs/{id}/retry — resume a failed job at its failed chunk.
pub async fn retry(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    owned_job(&state, &user.id, &id)?;
    let job = state.scheduler.retry_rca_job(&id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": job }))))
}
