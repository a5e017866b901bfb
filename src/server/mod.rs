//! HTTP surface exposing the task registry.
//!
//! The route set is the minimal contract the UI relies on: task CRUD plus
//! screenshot and DevTools lookups, and the `/ws` monitoring socket.

mod ws;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, instrument};

use crate::models::TaskExecution;
use crate::registry::{TaskOptions, TaskRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
}

pub fn build_router(registry: Arc<TaskRegistry>) -> Router {
    let state = AppState { registry };
    Router::new()
        .route("/health", get(health_handler))
        .route("/tasks", get(list_tasks_handler).post(create_task_handler))
        .route("/tasks/:task_id", get(get_task_handler))
        .route("/tasks/:task_id/stop", post(stop_task_handler))
        .route("/tasks/:task_id/screenshot", get(screenshot_handler))
        .route("/tasks/:task_id/cdp-url", get(cdp_url_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(registry: Arc<TaskRegistry>, bind_addr: &str) -> anyhow::Result<()> {
    let router = build_router(registry);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "http server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "graphpilot" }))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    description: String,
    #[serde(default)]
    headless: Option<bool>,
}

#[instrument(name = "api.tasks.create", skip(state, request))]
async fn create_task_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    let options = TaskOptions {
        headless: request.headless,
        ..TaskOptions::default()
    };
    match state.registry.create(&request.description, options) {
        Ok(execution) => (StatusCode::OK, Json(execution)).into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, serde::Serialize)]
struct TaskListResponse {
    tasks: Vec<TaskExecution>,
}

#[instrument(name = "api.tasks.list", skip(state))]
async fn list_tasks_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(TaskListResponse {
        tasks: state.registry.list(),
    })
}

#[instrument(name = "api.tasks.detail", skip(state))]
async fn get_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&task_id) {
        Some(execution) => Json(execution).into_response(),
        None => task_not_found(),
    }
}

#[instrument(name = "api.tasks.stop", skip(state))]
async fn stop_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    if state.registry.stop(&task_id) {
        Json(json!({ "ok": true })).into_response()
    } else {
        task_not_found()
    }
}

#[instrument(name = "api.tasks.screenshot", skip(state))]
async fn screenshot_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    let Some(path) = state.registry.screenshot_path(&task_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "no screenshot available" })),
        )
            .into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(err) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[instrument(name = "api.tasks.cdp_url", skip(state))]
async fn cdp_url_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.cdp_status(&task_id) {
        Some(info) => Json(info).into_response(),
        None => task_not_found(),
    }
}

fn task_not_found() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "task not found" })),
    )
        .into_response()
}
