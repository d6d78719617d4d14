// ABOUTME: Idempotency-Key handling for create-style endpoints
// ABOUTME: Replays the cached snapshot byte-for-byte on repeated requests

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
use axum::response::Response;
use bay_core::{CoreError, IdempotentBegin};
use serde::Serialize;
use std::future::Future;
use tracing::warn;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

fn json_response(status: StatusCode, body: String) -> ApiResult<Response> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| ApiError::internal(&format!("response build failed: {e}")))
}

/// Run a mutating handler under the caller's Idempotency-Key, if present.
///
/// Same key + same body replays the stored snapshot; a different body or an
/// in-flight duplicate conflicts. Handler failures release the claim so a
/// retry can run.
pub async fn run_idempotent<T, F, Fut>(
    state: &AppState,
    owner: &str,
    headers: &HeaderMap,
    scope: &str,
    body: &serde_json::Value,
    success_status: StatusCode,
    run: F,
) -> ApiResult<Response>
where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let Some(key) = key else {
        let value = run().await?;
        let body = serde_json::to_string(&value)
            .map_err(|e| ApiError::internal(&format!("serialization failed: {e}")))?;
        return json_response(success_status, body);
    };

    match state.idempotency.begin(owner, &key, scope, body).await? {
        IdempotentBegin::Replay { status, body } => {
            let status = StatusCode::from_u16(status as u16)
                .unwrap_or(StatusCode::OK);
            json_response(status, body)
        }
        IdempotentBegin::Execute => match run().await {
            Ok(value) => {
                let body = serde_json::to_string(&value)
                    .map_err(|e| ApiError::internal(&format!("serialization failed: {e}")))?;
                if let Err(e) = state
                    .idempotency
                    .complete(owner, &key, scope, success_status.as_u16() as i64, &body)
                    .await
                {
                    warn!(key = %key, scope = %scope, error = %e, "idempotency snapshot store failed");
                }
                json_response(success_status, body)
            }
            Err(e) => {
                if let Err(release_err) = state.idempotency.abandon(owner, &key, scope).await {
                    warn!(key = %key, scope = %scope, error = %release_err, "idempotency release failed");
                }
                Err(e.into())
            }
        },
    }
}
