use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{generate_salt, generate_token, hash_password, hash_token, AuthUser};
use crate::db::StoreError;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub username: String,
}

fn validate_credentials(body: &CredentialsRequest) -> ApiResult<()> {
    if body.username.trim().len() < 3 {
        return Err(ApiError::InvalidRequest(
            "username must be at least 3 characters".to_string(),
        ));
    }
    if body.password.len() < 8 {
        return Err(ApiError::InvalidRequest(
            "password must be at least 8 characters".to_string(),
        ));
    }
    Ok(())
}

fn issue_token(state: &AppState, user_id: &str, username: &str) -> ApiResult<TokenResponse> {
    let token = generate_token();
    let expires_at =
        state
            .db
            .insert_token(&hash_token(&token), user_id, state.config.auth.token_ttl_hours)?;
    Ok(TokenResponse {
        token,
        expires_at,
        username: username.to_string(),
    })
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_credentials(&body)?;
    let salt = generate_salt();
    let user = state
        .db
        .create_user(body.username.trim(), &hash_password(&body.password, &salt), &salt)?;
    let token = issue_token(&state, &user.id, &user.username)?;
    Ok((StatusCode::CREATED, Json(token)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let user = match state.db.user_by_username(body.username.trim()) {
        Ok(user) => user,
        Err(StoreError::NotFound) => return Err(ApiError::Unauthorized),
        Err(e) => return Err(e.into()),
    };
    if hash_password(&body.password, &user.salt) != user.password_hash {
        return Err(ApiError::Unauthorized);
    }
    Ok(Json(issue_token(&state, &user.id, &user.username)?))
}

pub async fn refresh(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<TokenResponse>> {
    Ok(Json(issue_token(&state, &user.id, &user.username)?))
}

pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<ChangePasswordRequest>,
) -> ApiResult<Json<TokenResponse>> {
    if hash_password(&body.current_password, &user.salt) != user.password_hash {
        return Err(ApiError::Forbidden("current password is incorrect".to_string()));
    }
    if body.new_password.len() < 8 {
        return Err(ApiError::InvalidRequest(
            "password must be at least 8 characters".to_string(),
        ));
    }

    let salt = generate_salt();
    state
        .db
        .update_password(&user.id, &hash_password(&body.new_password, &salt), &salt)?;
    // All existing sessions are revoked; hand back a fresh one
    state.db.delete_tokens_for_user(&user.id)?;
    Ok(Json(issue_token(&state, &user.id, &user.username)?))
}
