// ABOUTME: Bearer-token authentication middleware
// ABOUTME: Owner identity is derived from the token; dev mode accepts a header

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use tracing::debug;

/// Header carrying the caller identity in anonymous development mode.
pub const DEV_OWNER_HEADER: &str = "X-Bay-Owner";

/// Paths served without authentication.
const WHITELISTED_PATHS: &[&str] = &["/v1/health"];

/// Static token table plus the development-mode switch.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// token -> owner
    pub tokens: HashMap<String, String>,
    pub dev_mode: bool,
}

/// The authenticated caller identity, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct Owner(pub String);

pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path();
    if WHITELISTED_PATHS.iter().any(|p| path.starts_with(p)) {
        return Ok(next.run(request).await);
    }

    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    let owner = match bearer {
        Some(token) => state.auth.tokens.get(token).cloned(),
        None => None,
    };

    let owner = match owner {
        Some(owner) => owner,
        None if state.auth.dev_mode => {
            let from_header = request
                .headers()
                .get(DEV_OWNER_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            from_header.unwrap_or_else(|| "dev".to_string())
        }
        None => {
            return Err(ApiError::unauthorized(
                "missing or invalid bearer token",
            ))
        }
    };

    debug!(path = %path, owner = %owner, "request authenticated");
    request.extensions_mut().insert(Owner(owner));
    Ok(next.run(request).await)
}
