use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::files::LogFileRecord;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const ALLOWED_EXTENSIONS: &[&str] = &["json", "log", "txt"];

/// Look up a file and enforce ownership. Foreign files read as missing.
pub(crate) fn owned_file(
    state: &AppState,
    user_id: &str,
    file_id: &str,
) -> ApiResult<LogFileRecord> {
    let file = state.db.file_by_id(file_id)?;
    if file.user_id != user_id {
        return Err(ApiError::NotFound("log file not found".to_string()));
    }
    Ok(file)
}

fn extension_allowed(filename: &str) -> bool {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// POST /logs/upload — accept a multipart `logfile` field and queue async
/// parsing. Responds 202 while the parse runs in the background pool.
pub async fn upload(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let mut stored: Option<(String, usize, String)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("logfile") {
            continue;
        }
        let filename = field
            .file_name()
            .map(|s| s.to_string())
            .ok_or_else(|| ApiError::InvalidRequest("logfile field has no filename".to_string()))?;
        if !extension_allowed(&filename) {
            return Err(ApiError::InvalidRequest(
                "unsupported file type; expected .json, .log, or .txt".to_string(),
            ));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::InvalidRequest(format!("failed to read upload: {}", e)))?;
        if bytes.len() > state.config.server.max_upload_bytes {
            return Err(ApiError::PayloadTooLarge(format!(
                "file exceeds the {} byte limit",
                state.config.server.max_upload_bytes
            )));
        }
        if bytes.is_empty() {
            return Err(ApiError::InvalidRequest("uploaded file is empty".to_string()));
        }

        let dir = std::path::Path::new(&state.config.server.upload_dir);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ApiError::Internal(format!("upload dir unavailable: {}", e)))?;
        let stored_path = dir.join(format!("{}.upload", Uuid::new_v4()));
        tokio::fs::write(&stored_path, &bytes)
            .await
            .map_err(|e| ApiError::Internal(format!("could not store upload: {}", e)))?;

        stored = Some((
            filename,
            bytes.len(),
            stored_path.to_string_lossy().into_owned(),
        ));
        break;
    }

    let (filename, size, stored_path) = stored.ok_or_else(|| {
        ApiError::InvalidRequest("multipart field 'logfile' is required".to_string())
    })?;

    let file = state
        .db
        .insert_file(&user.id, &filename, size as i64, &stored_path)?;
    state.scheduler.submit_parse(&file.id)?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "logFile": file }))))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// GET /logs — owned files with pagination.
pub async fn list(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let (files, total) = state.db.list_files(&user.id, limit, offset)?;
    Ok(Json(json!({
        "logFiles": files,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /logs/{id} — detail plus parsed entries.
pub async fn detail(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let file = owned_file(&state, &user.id, &id)?;
    let entries = state.db.entries_for_file(&id, Some(1000))?;
    Ok(Json(json!({ "logFile": file, "entries": entries })))
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default, rename = "hardDelete")]
    pub hard_delete: bool,
}

/// DELETE /logs/{id}?hardDelete=bool
pub async fn remove(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let file = owned_file(&state, &user.id, &id)?;
    state.db.delete_file(&file.id, query.hard_delete)?;

    // The stored upload goes with the record
    if let Some(stored_path) = file.stored_path {
        let _ = tokio::fs::remove_file(&stored_path).await;
    }

    Ok(Json(json!({
        "deleted": file.id,
        "hard": query.hard_delete,
    })))
}
