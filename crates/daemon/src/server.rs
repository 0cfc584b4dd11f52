use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use factory_backup_core::{BackupError, BACKUP_TYPE_MANUAL};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::manager::{
    BackupManager, BackupPage, BackupResult, BackupStatistics, BackupView, ManagerStatus,
    OrphanReport, VerifyReport,
};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BackupManager>,
    pub api_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/backups", get(api_list_backups).post(api_create_backup))
        .route(
            "/api/v1/backups/{id}",
            get(api_backup_detail).delete(api_delete_backup),
        )
        .route("/api/v1/backups/{id}/download", get(download_backup))
        .route("/api/v1/backups/{id}/verify", post(api_verify_backup))
        .route("/api/v1/statistics", get(api_statistics))
        .route("/api/v1/status", get(api_status))
        .route("/api/v1/reconcile", post(api_reconcile))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

/// Maps typed backup errors to their HTTP status; anything else is a 500.
fn map_error(e: anyhow::Error) -> ApiError {
    match e.downcast_ref::<BackupError>() {
        Some(BackupError::AlreadyRunning) => api_error(StatusCode::CONFLICT, e.to_string()),
        Some(BackupError::NotFound(_)) | Some(BackupError::ArchiveMissing(_)) => {
            api_error(StatusCode::NOT_FOUND, e.to_string())
        }
        _ => {
            error!(error = %format!("{e:#}"), "request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(api_error(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

async fn api_list_backups(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<BackupPage>, ApiError> {
    require_api_auth(&state, &headers)?;
    let page = state
        .manager
        .get_backup_list(query.page.unwrap_or(1), query.limit.unwrap_or(20))
        .await
        .map_err(map_error)?;
    Ok(Json(page))
}

#[derive(Debug, Default, Deserialize)]
struct CreateBackupRequest {
    description: Option<String>,
}

async fn api_create_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<BackupResult>), ApiError> {
    require_api_auth(&state, &headers)?;
    let request: CreateBackupRequest = if body.is_empty() {
        CreateBackupRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")))?
    };
    let description = request.description.filter(|d| !d.trim().is_empty());

    // Run detached so a dropped connection cannot abandon a backup halfway.
    let manager = state.manager.clone();
    let result = tokio::spawn(async move {
        manager.create_backup(BACKUP_TYPE_MANUAL, description).await
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(map_error)?;

    Ok((StatusCode::CREATED, Json(result)))
}

async fn api_backup_detail(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BackupView>, ApiError> {
    require_api_auth(&state, &headers)?;
    let backup = state
        .manager
        .get_backup_by_id(id)
        .await
        .map_err(map_error)?
        .ok_or_else(|| map_error(BackupError::NotFound(id).into()))?;
    Ok(Json(backup))
}

async fn api_delete_backup(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_api_auth(&state, &headers)?;
    state.manager.delete_backup(id).await.map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_verify_backup(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<VerifyReport>, ApiError> {
    require_api_auth(&state, &headers)?;
    let report = state.manager.verify_backup(id).await.map_err(map_error)?;
    Ok(Json(report))
}

async fn download_backup(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_api_auth(&state, &headers)?;
    let backup = state
        .manager
        .get_backup_by_id(id)
        .await
        .map_err(map_error)?
        .ok_or_else(|| map_error(BackupError::NotFound(id).into()))?;
    if !backup.file_exists {
        warn!(backup_id = id, "download requested for missing archive");
        return Err(map_error(
            BackupError::ArchiveMissing(backup.record.file_path).into(),
        ));
    }

    let bytes = tokio::fs::read(&backup.record.file_path)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut response = Body::from(bytes).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zstd"),
    );
    let disposition = format!("attachment; filename={}", backup.record.filename);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn api_statistics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BackupStatistics>, ApiError> {
    require_api_auth(&state, &headers)?;
    let stats = state
        .manager
        .get_backup_statistics()
        .await
        .map_err(map_error)?;
    Ok(Json(stats))
}

async fn api_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ManagerStatus>, ApiError> {
    require_api_auth(&state, &headers)?;
    Ok(Json(state.manager.get_status()))
}

#[derive(Debug, Deserialize)]
struct ReconcileQuery {
    #[serde(default)]
    remove: bool,
}

async fn api_reconcile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ReconcileQuery>,
) -> Result<Json<OrphanReport>, ApiError> {
    require_api_auth(&state, &headers)?;
    let report = state
        .manager
        .reconcile(query.remove)
        .await
        .map_err(map_error)?;
    Ok(Json(report))
}
