// ABOUTME: Admin and health endpoints
// ABOUTME: Manual GC sweep trigger plus an unauthenticated health probe

use crate::auth::Owner;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::State;
use axum::{Extension, Json};
use bay_core::GcReport;
use bay_core::Profile;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn trigger_gc(
    State(state): State<AppState>,
    Extension(Owner(_owner)): Extension<Owner>,
) -> ApiResult<Json<GcReport>> {
    Ok(Json(state.gc.sweep().await))
}

#[derive(Serialize)]
pub struct ProfileListResponse {
    pub items: Vec<Profile>,
}

pub async fn list_profiles(
    State(state): State<AppState>,
    Extension(Owner(_owner)): Extension<Owner>,
) -> ApiResult<Json<ProfileListResponse>> {
    Ok(Json(ProfileListResponse {
        items: state.profiles.list().into_iter().cloned().collect(),
    }))
}
