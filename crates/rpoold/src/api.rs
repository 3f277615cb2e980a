//! JSON administration API under `/api/v1`.
//!
//! Every response uses the `{success, data?, error?, message?, timestamp}`
//! envelope. Authentication mirrors the WebDAV frontend; a failed check is
//! a 401 envelope, unknown routes and files are 404, malformed bodies 400.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rpool_core::types::unix_now;
use rpool_engine::PoolEngine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<PoolEngine>,
    pub auth: Arc<AuthManager>,
}

#[derive(Debug, Serialize)]
struct Envelope {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    timestamp: f64,
}

fn ok_data(data: impl Serialize) -> Response {
    let value = serde_json::to_value(data).unwrap_or(Value::Null);
    (
        StatusCode::OK,
        Json(Envelope {
            success: true,
            data: Some(value),
            error: None,
            message: None,
            timestamp: unix_now(),
        }),
    )
        .into_response()
}

fn ok_message(message: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        Json(Envelope {
            success: true,
            data: None,
            error: None,
            message: Some(message.into()),
            timestamp: unix_now(),
        }),
    )
        .into_response()
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(Envelope {
            success: false,
            data: None,
            error: Some(error.into()),
            message: None,
            timestamp: unix_now(),
        }),
    )
        .into_response()
}

fn map_pool_error(e: rpool_core::PoolError) -> Response {
    if e.is_not_found() {
        error_response(StatusCode::NOT_FOUND, e.to_string())
    } else {
        tracing::error!(error = %e, "api request failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<String, Response> {
    state
        .auth
        .verify(headers)
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "authentication required"))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/files", get(list_files).post(upload_file))
        .route("/api/v1/files/{*path}", get(get_file).delete(delete_file))
        .route("/api/v1/remotes", get(remotes))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/health", get(health))
        .route("/api/v1/verify", post(verify))
        .route("/api/v1/repair", post(repair))
        .route("/api/v1/rebalance", post(rebalance))
        .route("/api/v1/docs", get(docs))
        .route("/api/v1/plugins", get(plugins))
        .fallback(|| async { error_response(StatusCode::NOT_FOUND, "not found") })
        .with_state(state)
}

async fn status(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let config = state.engine.config();
    ok_data(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "user": user,
        "remotes": config.remotes,
        "chunk_size": config.chunk_size,
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_dir")]
    dir: String,
    #[serde(default)]
    recursive: bool,
}

fn default_dir() -> String {
    "/".to_string()
}

async fn list_files(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    match state.engine.list(&query.dir, query.recursive).await {
        Ok(files) => ok_data(json!({ "files": files, "count": files.len() })),
        Err(e) => map_pool_error(e),
    }
}

async fn get_file(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    match state.engine.load_manifest(&path).await {
        Ok(Some(manifest)) => ok_data(manifest),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "file not found"),
        Err(e) => map_pool_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    local_path: String,
    remote_path: String,
}

async fn upload_file(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<UploadBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state
        .engine
        .upload(
            std::path::Path::new(&body.local_path),
            &body.remote_path,
            &CancellationToken::new(),
        )
        .await
    {
        Ok(manifest) => ok_message(format!("file uploaded: {}", manifest.file_path)),
        Err(e) => map_pool_error(e),
    }
}

async fn delete_file(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    match state.engine.delete(&path).await {
        Ok(()) => ok_message(format!("file deleted: /{path}")),
        Err(e) => map_pool_error(e),
    }
}

async fn remotes(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let report = state.engine.balancer().usage_report().await;
    let remotes: Vec<Value> = report
        .values()
        .map(|status| {
            json!({
                "name": status.name,
                "used": status.used,
                "free": status.free,
                "total": status.total,
                "utilization": status.utilization(),
                "weight": status.weight,
                "priority": status.priority,
                "enabled": status.enabled,
            })
        })
        .collect();
    ok_data(json!({ "remotes": remotes }))
}

async fn stats(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    match state.engine.stats().await {
        Ok(stats) => ok_data(stats),
        Err(e) => map_pool_error(e),
    }
}

async fn health(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    ok_data(json!({ "status": "healthy", "timestamp": unix_now() }))
}

#[derive(Debug, Deserialize)]
struct VerifyBody {
    file_path: String,
    #[serde(default)]
    quick: bool,
}

async fn verify(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<VerifyBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.engine.verifier().verify(&body.file_path, body.quick).await {
        Ok(result) => ok_data(result),
        Err(e) => map_pool_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct RepairBody {
    file_path: String,
    local_source: String,
}

async fn repair(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<RepairBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state
        .engine
        .verifier()
        .repair(&body.file_path, std::path::Path::new(&body.local_source))
        .await
    {
        Ok(result) => ok_data(result),
        Err(e) => map_pool_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct RebalanceBody {
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_target_variance")]
    target_variance: f64,
}

fn default_target_variance() -> f64 {
    5.0
}

async fn rebalance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<RebalanceBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state
        .engine
        .rebalancer()
        .rebalance(body.target_variance, body.dry_run, &CancellationToken::new())
        .await
    {
        Ok(outcome) => ok_data(outcome),
        Err(e) => map_pool_error(e),
    }
}

async fn plugins(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    ok_data(json!({ "plugins": state.engine.plugins().list() }))
}

async fn docs() -> Response {
    ok_data(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /api/v1/status": "pool status",
            "GET /api/v1/files": "list files (params: dir, recursive)",
            "GET /api/v1/files/{path}": "file manifest",
            "POST /api/v1/files": "upload file (body: local_path, remote_path)",
            "DELETE /api/v1/files/{path}": "delete file",
            "GET /api/v1/remotes": "usage report",
            "GET /api/v1/stats": "pool totals",
            "GET /api/v1/health": "health check",
            "GET /api/v1/plugins": "registered plugins",
            "POST /api/v1/verify": "verify file (body: file_path, quick)",
            "POST /api/v1/repair": "repair file (body: file_path, local_source)",
            "POST /api/v1/rebalance": "rebalance pool (body: dry_run, target_variance)",
        },
        "authentication": {
            "methods": ["basic", "api_key", "bearer"],
        },
    }))
}
