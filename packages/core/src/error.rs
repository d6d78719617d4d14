// ABOUTME: Core error taxonomy - every fallible orchestration path lands here
// ABOUTME: The HTTP layer translates these into the public error codes

use bay_driver::DriverError;
use bay_runtime::RuntimeError;
use bay_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Capability not supported: {0}")]
    CapabilityNotSupported(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Sandbox expired: {0}")]
    SandboxExpired(String),

    #[error("Sandbox has infinite TTL: {0}")]
    SandboxTtlInfinite(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Session not ready for sandbox {sandbox_id}")]
    SessionNotReady {
        sandbox_id: String,
        retry_after_ms: u64,
    },

    #[error("Runtime failed: {0}")]
    RuntimeFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Map an adapter failure on a ready session into the public taxonomy.
    /// Connection failures after readiness are upstream runtime failures, not
    /// retry-forever conditions; the next request heals through the probe.
    pub fn from_capability_error(e: RuntimeError) -> Self {
        match e {
            RuntimeError::FileNotFound(path) => Self::FileNotFound(path),
            RuntimeError::Unsupported(op) => Self::CapabilityNotSupported(op),
            RuntimeError::Timeout(what) => Self::Timeout(what),
            RuntimeError::Unreachable(what) => Self::RuntimeFailed(what),
            RuntimeError::Upstream { status, message } => {
                Self::RuntimeFailed(format!("runtime returned {status}: {message}"))
            }
            RuntimeError::Protocol(what) => Self::RuntimeFailed(what),
            RuntimeError::MetaInvalid(what) => Self::Internal(what),
        }
    }
}
