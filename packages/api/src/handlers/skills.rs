// ABOUTME: HTTP handlers for the skill lifecycle control plane
// ABOUTME: Candidates, releases (soft-delete with reason), rollback, payload blobs

use crate::auth::Owner;
use crate::error::{ApiError, ApiResult};
use crate::idem::run_idempotent;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{Extension, Json};
use bay_storage::{SkillCandidate, SkillEvaluation, SkillPayload, SkillRelease, SkillReleaseStage};
use serde::{Deserialize, Serialize};

const PROMOTE_SCOPE: &str = "skills.promote";

#[derive(Deserialize)]
pub struct CandidateCreateRequest {
    pub skill_key: String,
    pub source_execution_ids: Vec<String>,
    #[serde(default)]
    pub payload_ref: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

pub async fn create_candidate(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Json(request): Json<CandidateCreateRequest>,
) -> ApiResult<(StatusCode, Json<SkillCandidate>)> {
    let candidate = state
        .skills
        .create_candidate(
            &owner,
            &request.skill_key,
            &request.source_execution_ids,
            request.payload_ref,
            request.summary,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(candidate)))
}

#[derive(Deserialize)]
pub struct CandidateListQuery {
    #[serde(default)]
    pub skill_key: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct CandidateListResponse {
    pub items: Vec<SkillCandidate>,
}

pub async fn list_candidates(
    State(state): State<AppState>,
    Extension(Owner(_owner)): Extension<Owner>,
    Query(query): Query<CandidateListQuery>,
) -> ApiResult<Json<CandidateListResponse>> {
    let items = state
        .skills
        .list_candidates(
            query.skill_key.as_deref(),
            query.limit.unwrap_or(50).clamp(1, 200),
        )
        .await?;
    Ok(Json(CandidateListResponse { items }))
}

pub async fn get_candidate(
    State(state): State<AppState>,
    Extension(Owner(_owner)): Extension<Owner>,
    Path(candidate_id): Path<String>,
) -> ApiResult<Json<SkillCandidate>> {
    Ok(Json(state.skills.get_candidate(&candidate_id).await?))
}

#[derive(Deserialize)]
pub struct EvaluateRequest {
    pub passed: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub report: Option<String>,
}

pub async fn evaluate_candidate(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(candidate_id): Path<String>,
    Json(request): Json<EvaluateRequest>,
) -> ApiResult<Json<SkillEvaluation>> {
    let evaluation = state
        .skills
        .evaluate(
            &candidate_id,
            request.passed,
            request.score,
            request.report,
            Some(owner),
        )
        .await?;
    Ok(Json(evaluation))
}

#[derive(Deserialize, Serialize, Clone)]
pub struct PromoteRequest {
    #[serde(default = "default_stage")]
    pub stage: String,
}

fn default_stage() -> String {
    "canary".to_string()
}

pub async fn promote_candidate(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(candidate_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PromoteRequest>,
) -> ApiResult<Response> {
    let stage = SkillReleaseStage::parse(&request.stage)
        .map_err(|e| ApiError::validation(&e.to_string()))?;

    let mut body = serde_json::to_value(&request)
        .map_err(|e| ApiError::internal(&format!("request re-serialization failed: {e}")))?;
    // The candidate id is part of the idempotent request identity.
    if let Some(map) = body.as_object_mut() {
        map.insert(
            "candidate_id".to_string(),
            serde_json::Value::String(candidate_id.clone()),
        );
    }

    run_idempotent(
        &state,
        &owner,
        &headers,
        PROMOTE_SCOPE,
        &body,
        StatusCode::CREATED,
        || async {
            let release = state
                .skills
                .promote(&candidate_id, stage, Some(owner.clone()))
                .await?;
            Ok(release)
        },
    )
    .await
}

#[derive(Deserialize)]
pub struct ReleaseListQuery {
    #[serde(default)]
    pub skill_key: Option<String>,
}

#[derive(Serialize)]
pub struct ReleaseListResponse {
    pub items: Vec<SkillRelease>,
}

pub async fn list_releases(
    State(state): State<AppState>,
    Extension(Owner(_owner)): Extension<Owner>,
    Query(query): Query<ReleaseListQuery>,
) -> ApiResult<Json<ReleaseListResponse>> {
    let items = state.skills.list_releases(query.skill_key.as_deref()).await?;
    Ok(Json(ReleaseListResponse { items }))
}

#[derive(Serialize)]
pub struct RollbackResponse {
    pub rolled_back: SkillRelease,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactivated: Option<SkillRelease>,
}

pub async fn rollback_release(
    State(state): State<AppState>,
    Extension(Owner(_owner)): Extension<Owner>,
    Path(release_id): Path<String>,
) -> ApiResult<Json<RollbackResponse>> {
    let outcome = state.skills.rollback(&release_id).await?;
    Ok(Json(RollbackResponse {
        rolled_back: outcome.rolled_back,
        reactivated: outcome.reactivated,
    }))
}

// ============================================================================
// SOFT DELETES
// ============================================================================

#[derive(Deserialize, Default)]
pub struct SkillDeleteRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct SkillDeleteResponse {
    pub id: String,
    pub deleted_at: chrono::DateTime<chrono::Utc>,
    pub deleted_by: Option<String>,
    pub delete_reason: Option<String>,
}

pub async fn delete_candidate(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(candidate_id): Path<String>,
    body: Option<Json<SkillDeleteRequest>>,
) -> ApiResult<Json<SkillDeleteResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let candidate = state
        .skills
        .delete_candidate(&candidate_id, Some(owner), request.reason)
        .await?;
    let deleted_at = candidate
        .deleted_at
        .ok_or_else(|| ApiError::internal("deleted candidate is missing its timestamp"))?;
    Ok(Json(SkillDeleteResponse {
        id: candidate.id,
        deleted_at,
        deleted_by: candidate.deleted_by,
        delete_reason: candidate.delete_reason,
    }))
}

pub async fn delete_release(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(release_id): Path<String>,
    body: Option<Json<SkillDeleteRequest>>,
) -> ApiResult<Json<SkillDeleteResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let release = state
        .skills
        .delete_release(&release_id, Some(owner), request.reason)
        .await?;
    let deleted_at = release
        .deleted_at
        .ok_or_else(|| ApiError::internal("deleted release is missing its timestamp"))?;
    Ok(Json(SkillDeleteResponse {
        id: release.id,
        deleted_at,
        deleted_by: release.deleted_by,
        delete_reason: release.delete_reason,
    }))
}

// ============================================================================
// PAYLOAD BLOBS
// ============================================================================

#[derive(Deserialize)]
pub struct PayloadCreateRequest {
    pub payload: serde_json::Value,
    #[serde(default = "default_payload_kind")]
    pub kind: String,
}

fn default_payload_kind() -> String {
    "generic".to_string()
}

#[derive(Serialize)]
pub struct PayloadCreateResponse {
    pub payload_ref: String,
    pub kind: String,
}

pub async fn create_payload(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Json(request): Json<PayloadCreateRequest>,
) -> ApiResult<(StatusCode, Json<PayloadCreateResponse>)> {
    let payload = state
        .skills
        .create_payload(&owner, &request.kind, request.payload)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PayloadCreateResponse {
            payload_ref: payload.payload_ref,
            kind: payload.kind,
        }),
    ))
}

pub async fn get_payload(
    State(state): State<AppState>,
    Extension(Owner(_owner)): Extension<Owner>,
    Path(payload_ref): Path<String>,
) -> ApiResult<Json<SkillPayload>> {
    Ok(Json(state.skills.get_payload(&payload_ref).await?))
}
