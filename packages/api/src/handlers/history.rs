// ABOUTME: HTTP handlers for execution history
// ABOUTME: List with filters, get, last-for-sandbox, annotate

use crate::auth::Owner;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use bay_storage::{ExecType, ExecutionFilter, ExecutionRecord};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default, rename = "type")]
    pub exec_type: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct HistoryListResponse {
    pub items: Vec<ExecutionRecord>,
}

pub async fn list_executions(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryListResponse>> {
    let exec_type = query
        .exec_type
        .as_deref()
        .map(ExecType::parse)
        .transpose()
        .map_err(|e| ApiError::validation(&e.to_string()))?;

    let filter = ExecutionFilter {
        sandbox_id: query.sandbox_id,
        exec_type,
        success: query.success,
        tag: query.tag,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
    };

    let items = state.history.list(&owner, &filter).await?;
    Ok(Json(HistoryListResponse { items }))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    let record = state.history.get(&execution_id, &owner).await?;
    Ok(Json(record))
}

pub async fn last_execution(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    let record = state.history.last_for_sandbox(&sandbox_id, &owner).await?;
    Ok(Json(record))
}

#[derive(Deserialize)]
pub struct AnnotateRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn annotate_execution(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(execution_id): Path<String>,
    Json(request): Json<AnnotateRequest>,
) -> ApiResult<Json<ExecutionRecord>> {
    let record = state
        .history
        .annotate(
            &execution_id,
            &owner,
            request.description.as_deref(),
            request.tags.as_deref(),
            request.notes.as_deref(),
        )
        .await?;
    Ok(Json(record))
}
