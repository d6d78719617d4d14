// ABOUTME: Public error taxonomy - translates core errors into HTTP responses
// ABOUTME: Every response carries a stable code and a correlation id for log lookup

use axum::http::{header::RETRY_AFTER, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bay_core::CoreError;
use serde::Serialize;
use tracing::{error, warn};

/// Millisecond-precision retry hint header on 503 responses.
pub const RETRY_AFTER_MS_HEADER: &str = "Retry-After-Ms";

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
    correlation_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

impl ApiError {
    pub fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: message.to_string(),
            retry_after_ms: None,
        }
    }

    pub fn validation(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation_error",
            message: message.to_string(),
            retry_after_ms: None,
        }
    }

    pub fn internal(message: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.to_string(),
            retry_after_ms: None,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NotFound(message) => Self {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message,
                retry_after_ms: None,
            },
            CoreError::Validation(message) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "validation_error",
                message,
                retry_after_ms: None,
            },
            CoreError::InvalidPath(message) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "invalid_path",
                message,
                retry_after_ms: None,
            },
            CoreError::CapabilityNotSupported(message) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "capability_not_supported",
                message,
                retry_after_ms: None,
            },
            CoreError::Conflict(message) => Self {
                status: StatusCode::CONFLICT,
                code: "conflict",
                message,
                retry_after_ms: None,
            },
            CoreError::SandboxExpired(sandbox_id) => Self {
                status: StatusCode::CONFLICT,
                code: "sandbox_expired",
                message: format!("sandbox {sandbox_id} has expired"),
                retry_after_ms: None,
            },
            CoreError::SandboxTtlInfinite(sandbox_id) => Self {
                status: StatusCode::CONFLICT,
                code: "sandbox_ttl_infinite",
                message: format!("sandbox {sandbox_id} has no expiry to extend"),
                retry_after_ms: None,
            },
            CoreError::FileNotFound(path) => Self {
                status: StatusCode::NOT_FOUND,
                code: "file_not_found",
                message: format!("workspace file not found: {path}"),
                retry_after_ms: None,
            },
            CoreError::SessionNotReady {
                sandbox_id,
                retry_after_ms,
            } => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "session_not_ready",
                message: format!("session for sandbox {sandbox_id} is not ready yet"),
                retry_after_ms: Some(retry_after_ms),
            },
            CoreError::RuntimeFailed(message) => Self {
                status: StatusCode::BAD_GATEWAY,
                code: "runtime_error",
                message,
                retry_after_ms: None,
            },
            CoreError::Timeout(message) => Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                code: "timeout",
                message,
                retry_after_ms: None,
            },
            // Integrity and backend internals are never exposed raw.
            CoreError::Storage(e) => {
                error!(error = %e, "storage failure surfaced to API");
                Self::internal("internal storage error")
            }
            CoreError::Driver(e) => {
                error!(error = %e, "driver failure surfaced to API");
                Self::internal("internal backend error")
            }
            CoreError::Internal(message) => {
                error!(error = %message, "internal failure surfaced to API");
                Self::internal("internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        warn!(
            code = self.code,
            status = %self.status,
            correlation_id = %correlation_id,
            message = %self.message,
            "request failed"
        );

        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: &self.message,
                correlation_id: &correlation_id,
                retry_after_ms: self.retry_after_ms,
            },
        });

        let mut response = (self.status, body).into_response();
        if let Some(retry_after_ms) = self.retry_after_ms {
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&retry_after_ms.to_string()) {
                headers.insert(RETRY_AFTER_MS_HEADER, value);
            }
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                headers.insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
