//! HTTP API assembly: REST routes per aggregate, shared layers, health.

pub mod analyze;
pub mod auth;
pub mod feedback;
pub mod llm;
pub mod logs;
pub mod rules;

use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.server.enable_cors {
        let origins = state
            .config
            .server
            .cors_origins
            .iter()
            .filter_map(|s| s.parse::<axum::http::HeaderValue>().ok())
            .collect::<Vec<_>>();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    } else {
        CorsLayer::new()
    };

    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    // Multipart framing overhead on top of the raw upload cap
    let body_limit = state.config.server.max_upload_bytes + 64 * 1024;

    Router::new()
        .route("/health", get(health_handler))
        // Credentials (collaborator surface)
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/change-password", post(auth::change_password))
        // Log files
        .route("/logs/upload", post(logs::upload))
        .route("/logs", get(logs::list))
        .route("/logs/{id}", get(logs::detail).delete(logs::remove))
        // Analysis jobs
        .route("/logs/{id}/analyze", post(analyze::create))
        .route("/logs/{id}/rca-results", get(analyze::results))
        .route("/logs/{id}/analyses", get(analyze::analyses))
        .route("/logs/{id}/jobs", get(analyze::jobs_for_file))
        .route("/jobs/{id}/status", get(analyze::status))
        .route("/jobs/{id}/cancel", post(analyze::cancel))
        .route("/jobs/{id}/retry", post(analyze::retry))
        // Feedback
        .route("/analyses/{id}/feedback", post(feedback::submit))
        .route("/feedback/insights", get(feedback::insights))
        // Parsing rules
        .route("/parsing-rules", get(rules::list).post(rules::create))
        .route(
            "/parsing-rules/{id}",
            get(rules::detail).put(rules::update).delete(rules::remove),
        )
        .route("/parsing-rules/test", post(rules::test))
        // LLM configuration and observability
        .route("/llm/status", get(llm::status))
        .route("/llm/calls", get(llm::calls))
        .route(
            "/settings/llm-endpoint",
            get(llm::get_settings).put(llm::update_settings),
        )
        .route("/settings/test-llm-endpoint", post(llm::test_endpoint))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    request_timeout,
                ))
                .layer(DefaultBodyLimit::max(body_limit))
                .layer(cors),
        )
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.db.with(|conn| {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    });

    let status_code = if db_ok.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(json!({
            "status": if db_ok.is_ok() { "healthy" } else { "unhealthy" },
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
