// ABOUTME: Runtime adapter trait and wire types for talking to sandbox runtimes
// ABOUTME: One adapter implementation per runtime kind (ship = code exec, gull = browser)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gull;
pub mod pool;
pub mod ship;
mod wire;

pub use gull::GullAdapter;
pub use pool::AdapterPool;
pub use ship::ShipAdapter;

/// Conventional mount path every cargo appears at inside a container.
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

/// Runtime wire protocol version this service speaks.
pub const RUNTIME_API_VERSION: &str = "v1";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Runtime unreachable: {0}")]
    Unreachable(String),

    #[error("Runtime request timed out: {0}")]
    Timeout(String),

    #[error("Runtime returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Workspace file not found: {0}")]
    FileNotFound(String),

    #[error("Malformed runtime response: {0}")]
    Protocol(String),

    #[error("Runtime meta validation failed: {0}")]
    MetaInvalid(String),

    #[error("Operation not supported by this runtime: {0}")]
    Unsupported(String),
}

impl RuntimeError {
    /// Connection-level failures may resolve on retry; wire errors will not.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Which runtime protocol a container speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Ship,
    Gull,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ship => "ship",
            Self::Gull => "gull",
        }
    }
}

/// Runtime self-description returned by the `/meta` probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMeta {
    pub name: String,
    pub version: String,
    pub api_version: String,
    pub mount_path: String,
    pub capabilities: Vec<String>,
}

impl RuntimeMeta {
    /// Validate the probed meta against what the profile promised.
    ///
    /// Called once at first successful probe; failure is fatal for the
    /// session because the container is not the runtime we expect.
    pub fn validate(&self, required_capabilities: &[String]) -> Result<()> {
        if self.mount_path != WORKSPACE_MOUNT_PATH {
            return Err(RuntimeError::MetaInvalid(format!(
                "mount path {} does not match the {} convention",
                self.mount_path, WORKSPACE_MOUNT_PATH
            )));
        }
        if self.api_version != RUNTIME_API_VERSION {
            return Err(RuntimeError::MetaInvalid(format!(
                "incompatible runtime api version {}",
                self.api_version
            )));
        }
        for cap in required_capabilities {
            if !self.capabilities.iter().any(|c| c == cap) {
                return Err(RuntimeError::MetaInvalid(format!(
                    "runtime does not declare required capability {cap}"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a code or shell execution inside the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
}

/// Directory entry returned by filesystem listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// One command's result inside a browser batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserStep {
    pub command: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Aggregate result of a browser batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserBatchOutcome {
    pub success: bool,
    pub steps: Vec<BrowserStep>,
}

/// Capability-typed client for one runtime container.
///
/// Every adapter exposes the `meta` probe; the capability methods default to
/// `Unsupported` so each runtime implements only its own subset.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    fn endpoint(&self) -> &str;

    /// Readiness probe: success means the runtime is up and self-describing.
    /// Implementations cache the first successful result.
    async fn meta(&self) -> Result<RuntimeMeta>;

    async fn exec_python(&self, _code: &str, _timeout_secs: u64) -> Result<ExecOutcome> {
        Err(RuntimeError::Unsupported("python execution".into()))
    }

    async fn exec_shell(
        &self,
        _command: &str,
        _timeout_secs: u64,
        _cwd: Option<&str>,
    ) -> Result<ExecOutcome> {
        Err(RuntimeError::Unsupported("shell execution".into()))
    }

    async fn read_file(&self, _path: &str) -> Result<String> {
        Err(RuntimeError::Unsupported("filesystem read".into()))
    }

    async fn write_file(&self, _path: &str, _content: &str) -> Result<()> {
        Err(RuntimeError::Unsupported("filesystem write".into()))
    }

    async fn list_files(&self, _path: &str) -> Result<Vec<FileEntry>> {
        Err(RuntimeError::Unsupported("filesystem list".into()))
    }

    async fn delete_file(&self, _path: &str) -> Result<()> {
        Err(RuntimeError::Unsupported("filesystem delete".into()))
    }

    async fn upload_file(&self, _path: &str, _bytes: &[u8]) -> Result<()> {
        Err(RuntimeError::Unsupported("file upload".into()))
    }

    async fn download_file(&self, _path: &str) -> Result<Vec<u8>> {
        Err(RuntimeError::Unsupported("file download".into()))
    }

    async fn exec_browser(&self, _command: &str, _timeout_secs: u64) -> Result<BrowserStep> {
        Err(RuntimeError::Unsupported("browser execution".into()))
    }

    async fn exec_browser_batch(
        &self,
        _commands: &[String],
        _timeout_secs: u64,
        _stop_on_error: bool,
    ) -> Result<BrowserBatchOutcome> {
        Err(RuntimeError::Unsupported("browser batch execution".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(mount: &str, api: &str, caps: &[&str]) -> RuntimeMeta {
        RuntimeMeta {
            name: "ship".to_string(),
            version: "0.3.0".to_string(),
            api_version: api.to_string(),
            mount_path: mount.to_string(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_meta_validation_accepts_superset() {
        let m = meta("/workspace", "v1", &["python", "shell", "filesystem"]);
        assert!(m.validate(&["python".to_string()]).is_ok());
    }

    #[test]
    fn test_meta_validation_rejects_wrong_mount() {
        let m = meta("/data", "v1", &["python"]);
        assert!(matches!(
            m.validate(&[]),
            Err(RuntimeError::MetaInvalid(_))
        ));
    }

    #[test]
    fn test_meta_validation_rejects_missing_capability() {
        let m = meta("/workspace", "v1", &["shell"]);
        assert!(m.validate(&["browser".to_string()]).is_err());
    }

    #[test]
    fn test_meta_validation_rejects_api_mismatch() {
        let m = meta("/workspace", "v2", &[]);
        assert!(m.validate(&[]).is_err());
    }
}
