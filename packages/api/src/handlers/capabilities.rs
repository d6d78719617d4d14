// ABOUTME: HTTP handlers for capability invocations through a sandbox
// ABOUTME: Python/shell execution, workspace filesystem, browser automation

use crate::auth::Owner;
use crate::error::{ApiError, ApiResult};
use crate::idem::run_idempotent;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{Extension, Json};
use base64::Engine;
use bay_runtime::{BrowserStep, FileEntry};
use serde::{Deserialize, Serialize};

const BROWSER_BATCH_SCOPE: &str = "browser.exec_batch";

#[derive(Deserialize)]
pub struct PythonExecRequest {
    pub code: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Serialize)]
pub struct ExecResponse {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

pub async fn exec_python(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<PythonExecRequest>,
) -> ApiResult<Json<ExecResponse>> {
    let outcome = state
        .router
        .exec_python(&owner, &sandbox_id, &request.code, request.timeout)
        .await?;
    Ok(Json(ExecResponse {
        success: outcome.success,
        output: outcome.output,
        error: outcome.error,
        exit_code: outcome.exit_code,
    }))
}

#[derive(Deserialize)]
pub struct ShellExecRequest {
    pub command: String,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub cwd: Option<String>,
}

pub async fn exec_shell(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<ShellExecRequest>,
) -> ApiResult<Json<ExecResponse>> {
    let outcome = state
        .router
        .exec_shell(
            &owner,
            &sandbox_id,
            &request.command,
            request.timeout,
            request.cwd.as_deref(),
        )
        .await?;
    Ok(Json(ExecResponse {
        success: outcome.success,
        output: outcome.output,
        error: outcome.error,
        exit_code: outcome.exit_code,
    }))
}

// ============================================================================
// FILESYSTEM
// ============================================================================

#[derive(Deserialize)]
pub struct FilePathRequest {
    pub path: String,
}

#[derive(Serialize)]
pub struct FileReadResponse {
    pub content: String,
}

pub async fn read_file(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<FilePathRequest>,
) -> ApiResult<Json<FileReadResponse>> {
    let content = state
        .router
        .read_file(&owner, &sandbox_id, &request.path)
        .await?;
    Ok(Json(FileReadResponse { content }))
}

#[derive(Deserialize)]
pub struct FileWriteRequest {
    pub path: String,
    pub content: String,
}

#[derive(Serialize)]
pub struct OkResponse {
    pub status: &'static str,
}

pub async fn write_file(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<FileWriteRequest>,
) -> ApiResult<Json<OkResponse>> {
    state
        .router
        .write_file(&owner, &sandbox_id, &request.path, &request.content)
        .await?;
    Ok(Json(OkResponse { status: "ok" }))
}

#[derive(Deserialize)]
pub struct FileListRequest {
    #[serde(default = "default_list_path")]
    pub path: String,
}

fn default_list_path() -> String {
    ".".to_string()
}

#[derive(Serialize)]
pub struct FileListResponse {
    pub entries: Vec<FileEntry>,
}

pub async fn list_files(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<FileListRequest>,
) -> ApiResult<Json<FileListResponse>> {
    let entries = state
        .router
        .list_files(&owner, &sandbox_id, &request.path)
        .await?;
    Ok(Json(FileListResponse { entries }))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<FilePathRequest>,
) -> ApiResult<Json<OkResponse>> {
    state
        .router
        .delete_file(&owner, &sandbox_id, &request.path)
        .await?;
    Ok(Json(OkResponse { status: "ok" }))
}

#[derive(Deserialize)]
pub struct FileUploadRequest {
    pub path: String,
    pub content_b64: String,
}

pub async fn upload_file(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<FileUploadRequest>,
) -> ApiResult<Json<OkResponse>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(request.content_b64.as_bytes())
        .map_err(|e| ApiError::validation(&format!("content_b64 is not valid base64: {e}")))?;
    state
        .router
        .upload_file(&owner, &sandbox_id, &request.path, &bytes)
        .await?;
    Ok(Json(OkResponse { status: "ok" }))
}

#[derive(Serialize)]
pub struct FileDownloadResponse {
    pub content_b64: String,
}

pub async fn download_file(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<FilePathRequest>,
) -> ApiResult<Json<FileDownloadResponse>> {
    let bytes = state
        .router
        .download_file(&owner, &sandbox_id, &request.path)
        .await?;
    Ok(Json(FileDownloadResponse {
        content_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
    }))
}

// ============================================================================
// BROWSER
// ============================================================================

#[derive(Deserialize)]
pub struct BrowserExecRequest {
    pub command: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Serialize)]
pub struct BrowserStepResponse {
    pub command: String,
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl From<BrowserStep> for BrowserStepResponse {
    fn from(step: BrowserStep) -> Self {
        Self {
            command: step.command,
            success: step.success,
            output: step.output,
            error: step.error,
            duration_ms: step.duration_ms,
        }
    }
}

pub async fn exec_browser(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<BrowserExecRequest>,
) -> ApiResult<Json<BrowserStepResponse>> {
    let step = state
        .router
        .exec_browser(&owner, &sandbox_id, &request.command, request.timeout)
        .await?;
    Ok(Json(step.into()))
}

#[derive(Deserialize, Serialize, Clone)]
pub struct BrowserBatchRequest {
    pub commands: Vec<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub stop_on_error: bool,
}

#[derive(Serialize)]
pub struct BrowserBatchResponse {
    pub success: bool,
    pub steps: Vec<BrowserStepResponse>,
}

pub async fn exec_browser_batch(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(sandbox_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<BrowserBatchRequest>,
) -> ApiResult<Response> {
    let body = serde_json::to_value(&request)
        .map_err(|e| ApiError::internal(&format!("request re-serialization failed: {e}")))?;

    run_idempotent(
        &state,
        &owner,
        &headers,
        BROWSER_BATCH_SCOPE,
        &body,
        StatusCode::OK,
        || async {
            let outcome = state
                .router
                .exec_browser_batch(
                    &owner,
                    &sandbox_id,
                    &request.commands,
                    request.timeout,
                    request.stop_on_error,
                )
                .await?;
            Ok(BrowserBatchResponse {
                success: outcome.success,
                steps: outcome.steps.into_iter().map(Into::into).collect(),
            })
        },
    )
    .await
}
