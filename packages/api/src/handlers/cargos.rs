// ABOUTME: HTTP handlers for cargo (persistent volume) management
// ABOUTME: External cargos are created here; managed ones come from sandbox create

use crate::auth::Owner;
use crate::error::{ApiError, ApiResult};
use crate::idem::run_idempotent;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bay_storage::{Cargo, CargoKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const CREATE_SCOPE: &str = "cargos.create";

#[derive(Deserialize, Serialize, Clone)]
pub struct CreateCargoRequest {
    /// Reserved for future kinds; only external cargos can be created
    /// directly.
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Serialize)]
pub struct CargoResponse {
    pub id: String,
    pub kind: CargoKind,
    pub mount_path: String,
    pub managed_by_sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Cargo> for CargoResponse {
    fn from(cargo: Cargo) -> Self {
        Self {
            id: cargo.id,
            kind: cargo.kind,
            mount_path: cargo.mount_path,
            managed_by_sandbox_id: cargo.managed_by_sandbox_id,
            created_at: cargo.created_at,
        }
    }
}

pub async fn create_cargo(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    headers: HeaderMap,
    Json(request): Json<CreateCargoRequest>,
) -> ApiResult<Response> {
    if let Some(kind) = request.kind.as_deref() {
        if kind != "external" {
            return Err(ApiError::validation(
                "only external cargos can be created directly",
            ));
        }
    }

    let body = serde_json::to_value(&request)
        .map_err(|e| ApiError::internal(&format!("request re-serialization failed: {e}")))?;

    run_idempotent(
        &state,
        &owner,
        &headers,
        CREATE_SCOPE,
        &body,
        StatusCode::CREATED,
        || async {
            let cargo = state
                .cargo_mgr
                .create(&owner, CargoKind::External, None)
                .await?;
            Ok(CargoResponse::from(cargo))
        },
    )
    .await
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Serialize)]
pub struct CargoListResponse {
    pub items: Vec<CargoResponse>,
    pub next_cursor: Option<String>,
}

pub async fn list_cargos(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<CargoListResponse>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let cargos = state
        .cargo_mgr
        .list(&owner, limit, query.cursor.as_deref())
        .await?;

    let next_cursor = if cargos.len() as i64 == limit {
        cargos.last().map(|c| c.id.clone())
    } else {
        None
    };

    Ok(Json(CargoListResponse {
        items: cargos.into_iter().map(CargoResponse::from).collect(),
        next_cursor,
    }))
}

pub async fn get_cargo(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(cargo_id): Path<String>,
) -> ApiResult<Json<CargoResponse>> {
    let cargo = state.cargo_mgr.get(&cargo_id, &owner).await?;
    Ok(Json(CargoResponse::from(cargo)))
}

pub async fn delete_cargo(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(cargo_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.cargo_mgr.delete(&cargo_id, &owner, false).await?;
    Ok(StatusCode::NO_CONTENT)
}
