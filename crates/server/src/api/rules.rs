use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use pipeline::rules::{CompiledRule, ParsingRule};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthUser;
use crate::db::rules::RuleRecord;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn owned_rule(state: &AppState, user_id: &str, rule_id: &str) -> ApiResult<RuleRecord> {
    let rule = state.db.rule_by_id(rule_id)?;
    if rule.user_id != user_id {
        return Err(ApiError::NotFound("parsing rule not found".to_string()));
    }
    Ok(rule)
}

/// Bad patterns are rejected at save time, never at parse time.
fn validate(rule: &ParsingRule) -> ApiResult<()> {
    if rule.name.trim().is_empty() {
        return Err(ApiError::InvalidRequest("rule name is required".to_string()));
    }
    CompiledRule::compile(rule)
        .map(|_| ())
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

/// GET /parsing-rules
pub async fn list(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let rules = state.db.rules_for_user(&user.id)?;
    Ok(Json(json!({ "parsingRules": rules })))
}

/// POST /parsing-rules
pub async fn create(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(rule): Json<ParsingRule>,
) -> ApiResult<impl IntoResponse> {
    validate(&rule)?;
    let record = state.db.insert_rule(&user.id, &rule)?;
    Ok((StatusCode::CREATED, Json(json!({ "parsingRule": record }))))
}

/// GET /parsing-rules/{id}
pub async fn detail(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let rule = owned_rule(&state, &user.id, &id)?;
    Ok(Json(json!({ "parsingRule": rule })))
}

/// PUT /parsing-rules/{id}
pub async fn update(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(rule): Json<ParsingRule>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_rule(&state, &user.id, &id)?;
    validate(&rule)?;
    let record = state.db.update_rule(&id, &rule)?;
    Ok(Json(json!({ "parsingRule": record })))
}

/// DELETE /parsing-rules/{id}
pub async fn remove(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_rule(&state, &user.id, &id)?;
    state.db.delete_rule(&id)?;
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Deserialize)]
pub struct RuleTestRequest {
    pub rule: ParsingRule,
    #[serde(default)]
    pub sample_logs: Vec<String>,
}

/// POST /parsing-rules/test — dry-run a rule against a sample corpus;
/// nothing is written.
pub async fn test(
    State(_state): State<AppState>,
    AuthUser(_user): AuthUser,
    Json(body): Json<RuleTestRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.sample_logs.is_empty() {
        return Err(ApiError::InvalidRequest(
            "sample_logs must contain at least one line".to_string(),
        ));
    }
    let compiled =
        CompiledRule::compile(&body.rule).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let report = compiled.test_corpus(&body.sample_logs);
    Ok(Json(json!({ "report": report })))
}
