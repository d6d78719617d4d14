// ABOUTME: HTTP handlers for sandbox lifecycle operations
// ABOUTME: Create (idempotent), list, get, keepalive, stop, delete, extend-ttl, logs

use crate::auth::Owner;
use crate::error::{ApiError, ApiResult};
use crate::idem::run_idempotent;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bay_core::SandboxView;
use bay_storage::{Sandbox, SandboxStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

const CREATE_SCOPE: &str = "sandboxes.create";
const DEFAULT_PROFILE: &str = "python-default";

#[derive(Deserialize, Serialize, Clone)]
pub struct CreateSandboxRequest {
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub cargo_id: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Serialize)]
pub struct SandboxResponse {
    pub id: String,
    pub profile_id: String,
    pub cargo_id: String,
    pub status: SandboxStatus,
    pub current_session_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idle_expires_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SandboxResponse {
    fn from_parts(sandbox: Sandbox, status: SandboxStatus) -> Self {
        Self {
            id: sandbox.id,
            profile_id: sandbox.profile_id,
            cargo_id: sandbox.cargo_id,
            status,
            current_session_id: sandbox.current_session_id,
            expires_at: sandbox.expires_at,
            idle_expires_at: sandbox.idle_expires_at,
            last_activity: sandbox.last_activity,
            created_at: sandbox.created_at,
        }
    }

    fn from_view(view: SandboxView) -> Self {
        Self::from_parts(view.sandbox, view.status)
    }
}

#[derive(Serialize)]
pub struct SandboxListResponse {
    pub items: Vec<SandboxResponse>,
    pub next_cursor: Option<String>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

pub async fn create_sandbox(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    headers: HeaderMap,
    Json(request): Json<CreateSandboxRequest>,
) -> ApiResult<Response> {
    let body = serde_json::to_value(&request)
        .map_err(|e| ApiError::internal(&format!("request re-serialization failed: {e}")))?;
    let profile = request
        .profile
        .clone()
        .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

    run_idempotent(
        &state,
        &owner,
        &headers,
        CREATE_SCOPE,
        &body,
        StatusCode::CREATED,
        || async {
            let sandbox = state
                .sandbox_mgr
                .create(&owner, &profile, request.cargo_id.as_deref(), request.ttl_seconds)
                .await?;
            info!(sandbox_id = %sandbox.id, owner = %owner, "sandbox created");
            Ok(SandboxResponse::from_parts(sandbox, SandboxStatus::Idle))
        },
    )
    .await
}

pub async fn list_sandboxes(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<SandboxListResponse>> {
    let status_filter = query
        .status
        .as_deref()
        .map(SandboxStatus::parse)
        .transpose()
        .map_err(|e| ApiError::validation(&e.to_string()))?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);

    let views = state
        .sandbox_mgr
        .list(&owner, status_filter, limit, query.cursor.as_deref())
        .await?;

    let next_cursor = if views.len() as i64 == limit {
        views.last().map(|v| v.sandbox.id.clone())
    } else {
        None
    };

    Ok(Json(SandboxListResponse {
        items: views.into_iter().map(SandboxResponse::from_view).collect(),
        next_cursor,
    }))
}

pub async fn get_sandbox(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<SandboxResponse>> {
    let view = state.sandbox_mgr.get_view(&sandbox_id, &owner).await?;
    Ok(Json(SandboxResponse::from_view(view)))
}

pub async fn keepalive(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<SandboxResponse>> {
    state.sandbox_mgr.keepalive(&sandbox_id, &owner).await?;
    let view = state.sandbox_mgr.get_view(&sandbox_id, &owner).await?;
    Ok(Json(SandboxResponse::from_view(view)))
}

pub async fn stop_sandbox(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<SandboxResponse>> {
    state.sandbox_mgr.get(&sandbox_id, &owner).await?;
    state.sandbox_mgr.stop(&sandbox_id, &owner).await?;
    let view = state.sandbox_mgr.get_view(&sandbox_id, &owner).await?;
    Ok(Json(SandboxResponse::from_view(view)))
}

pub async fn delete_sandbox(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.sandbox_mgr.delete(&sandbox_id, &owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ExtendTtlRequest {
    pub extend_by_seconds: i64,
}

pub async fn extend_ttl(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<ExtendTtlRequest>,
) -> ApiResult<Json<SandboxResponse>> {
    state
        .sandbox_mgr
        .extend_ttl(&sandbox_id, &owner, request.extend_by_seconds)
        .await?;
    let view = state.sandbox_mgr.get_view(&sandbox_id, &owner).await?;
    Ok(Json(SandboxResponse::from_view(view)))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<usize>,
}

#[derive(Serialize)]
pub struct LogsResponse {
    pub content: String,
}

pub async fn sandbox_logs(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let tail = query.tail.unwrap_or(100).min(10_000);
    let content = state
        .sandbox_mgr
        .primary_logs(&sandbox_id, &owner, tail)
        .await?;
    Ok(Json(LogsResponse { content }))
}
