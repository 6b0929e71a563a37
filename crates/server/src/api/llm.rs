use axum::extract::State;
use axum::response::Json;
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /llm/status — health of the caller's configured endpoint.
pub async fn status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(endpoint) = state.endpoint_for(&user) else {
        return Ok(Json(json!({
            "status": "unconfigured",
            "endpoint": null,
        })));
    };

    match state.gateway.health(&endpoint).await {
        Ok(()) => {
            let models = state.gateway.list_models(&endpoint).await.unwrap_or_default();
            Ok(Json(json!({
                "status": "ok",
                "endpoint": endpoint,
                "models": models,
            })))
        }
        Err(e) => Ok(Json(json!({
            "status": "unavailable",
            "endpoint": endpoint,
            "error": e.to_string(),
        }))),
    }
}

/// GET /llm/calls — snapshot of the bounded call ring, newest last.
pub async fn calls(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let calls = state.gateway.recorder().snapshot();
    Ok(Json(json!({ "calls": calls, "capacity": state.config.llm.call_log_size })))
}

/// GET /settings/llm-endpoint — effective model configuration.
pub async fn get_settings(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(json!({
        "endpoint": state.endpoint_for(&user),
        "model": user
            .llm_model
            .unwrap_or_else(|| state.config.llm.default_model.clone()),
        "embeddingModel": user
            .embedding_model
            .unwrap_or_else(|| state.config.llm.default_embedding_model.clone()),
    })))
}

#[derive(Deserialize)]
pub struct LlmSettingsRequest {
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
}

/// PUT /settings/llm-endpoint
pub async fn update_settings(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<LlmSettingsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(endpoint) = body.endpoint.as_deref() {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ApiError::InvalidRequest(
                "endpoint must be an http(s) URL".to_string(),
            ));
        }
    }

    state.db.update_llm_settings(
        &user.id,
        body.endpoint.as_deref(),
        body.model.as_deref(),
        body.embedding_model.as_deref(),
    )?;
    Ok(Json(json!({ "updated": true })))
}

#[derive(Deserialize)]
pub struct TestEndpointRequest {
    pub endpoint: String,
}

/// POST /settings/test-llm-endpoint — probe an endpoint without saving it.
pub async fn test_endpoint(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
    Json(body): Json<TestEndpointRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    match state.gateway.health(&body.endpoint).await {
        Ok(()) => {
            let models = state
                .gateway
                .list_models(&body.endpoint)
                .await
                .unwrap_or_default();
            Ok(Json(json!({ "reachable": true, "models": models })))
        }
        Err(e) => Ok(Json(json!({ "reachable": false, "error": e.to_string() }))),
    }
}
