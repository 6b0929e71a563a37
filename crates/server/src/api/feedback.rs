use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthUser;
use crate::db::feedback::NewFeedback;
use crate::db::StoreError;
use crate::error::{ApiError, ApiResult};
use crate::services::FeedbackService;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct FeedbackRequest {
    pub is_correct: bool,
    #[serde(default)]
    pub correction: Option<String>,
}

/// POST /analyses/{id}/feedback — one review per user per analysis.
/// Classification fields are derived server-side and feed future
/// confidence scoring.
pub async fn submit(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(memory_id): Path<String>,
    Json(body): Json<FeedbackRequest>,
) -> ApiResult<impl IntoResponse> {
    let memory = state.db.memory_by_id(&memory_id)?;

    // Ownership flows through the file when it still exists; feedback on a
    // soft-deleted file's surviving analysis is allowed for any
    // authenticated reviewer
    match state.db.file_by_id(&memory.file_id) {
        Ok(file) if file.user_id != user.id => {
            return Err(ApiError::NotFound("analysis not found".to_string()));
        }
        Ok(_) | Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    if !body.is_correct && body.correction.as_deref().map_or(true, |c| c.trim().is_empty()) {
        return Err(ApiError::InvalidRequest(
            "a correction text is required when marking an analysis incorrect".to_string(),
        ));
    }

    let derived = FeedbackService::derive(&memory, body.is_correct, body.correction.as_deref());
    let record = state.db.insert_feedback(&NewFeedback {
        memory_id: &memory.id,
        user_id: Some(&user.id),
        is_correct: body.is_correct,
        correction: body.correction.as_deref(),
        feedback_type: derived.feedback_type,
        pattern_name: derived.pattern_name.as_deref(),
        root_cause_section: derived.root_cause_section.as_deref(),
        confidence_impact: derived.confidence_impact,
    })?;

    Ok((StatusCode::CREATED, Json(json!({ "feedback": record }))))
}

/// GET /feedback/insights — recomputed per-pattern aggregates.
pub async fn insights(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let insights = state.feedback.aggregate_insights()?;
    Ok(Json(json!({ "insights": insights })))
}
