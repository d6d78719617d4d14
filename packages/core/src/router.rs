// ABOUTME: CapabilityRouter - dispatches (sandbox, capability, operation) to runtime adapters
// ABOUTME: Ensures the session is running, picks the serving container, records history

use crate::error::{CoreError, Result};
use crate::history::ExecutionHistory;
use crate::paths::validate_workspace_path;
use crate::profiles::{Capability, ProfileRegistry};
use crate::sandbox::{ReadySession, SandboxManager};
use crate::session::SessionManager;
use bay_runtime::{
    AdapterPool, BrowserBatchOutcome, BrowserStep, ExecOutcome, FileEntry, RuntimeAdapter,
    RuntimeError, RuntimeKind,
};
use bay_storage::{ContainerObservedState, ExecType, SessionContainer};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Default and ceiling for per-call timeouts (seconds).
pub const DEFAULT_OP_TIMEOUT: u64 = 30;
pub const MAX_OP_TIMEOUT: u64 = 300;

/// Retry hint handed out for degraded-capability unavailability.
const RETRY_AFTER_MS: u64 = 1000;

struct Routed {
    ready: ReadySession,
    container: SessionContainer,
    adapter: Arc<dyn RuntimeAdapter>,
    is_primary: bool,
}

pub struct CapabilityRouter {
    sandbox_mgr: Arc<SandboxManager>,
    session_mgr: Arc<SessionManager>,
    profiles: Arc<ProfileRegistry>,
    pool: Arc<AdapterPool>,
    history: Arc<ExecutionHistory>,
}

impl CapabilityRouter {
    pub fn new(
        sandbox_mgr: Arc<SandboxManager>,
        session_mgr: Arc<SessionManager>,
        profiles: Arc<ProfileRegistry>,
        pool: Arc<AdapterPool>,
        history: Arc<ExecutionHistory>,
    ) -> Self {
        Self {
            sandbox_mgr,
            session_mgr,
            profiles,
            pool,
            history,
        }
    }

    pub fn clamp_timeout(timeout_secs: Option<u64>) -> u64 {
        timeout_secs
            .unwrap_or(DEFAULT_OP_TIMEOUT)
            .clamp(1, MAX_OP_TIMEOUT)
    }

    /// Resolve the adapter serving a capability, converging the session first.
    async fn route(&self, owner: &str, sandbox_id: &str, capability: Capability) -> Result<Routed> {
        let sandbox = self.sandbox_mgr.get(sandbox_id, owner).await?;
        let profile = self
            .profiles
            .get(&sandbox.profile_id)
            .ok_or_else(|| CoreError::Validation(format!("Invalid profile: {}", sandbox.profile_id)))?;

        // Contract check before any compute is spun up.
        if !profile.supports(capability) {
            return Err(CoreError::CapabilityNotSupported(format!(
                "profile {} does not provide {}",
                profile.id,
                capability.as_str()
            )));
        }
        let target_name = profile
            .container_for(capability)
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                CoreError::CapabilityNotSupported(capability.as_str().to_string())
            })?;

        let ready = self.sandbox_mgr.ensure_running(sandbox_id, owner).await?;

        let container = ready
            .containers
            .iter()
            .find(|c| c.name == target_name)
            .cloned()
            .ok_or_else(|| {
                CoreError::Internal(format!(
                    "session {} has no container {target_name}",
                    ready.session.id
                ))
            })?;

        // A failed non-primary container makes only its capabilities
        // unavailable; the next converge pass recovers it.
        if container.observed_state != ContainerObservedState::Running {
            return Err(CoreError::SessionNotReady {
                sandbox_id: sandbox_id.to_string(),
                retry_after_ms: RETRY_AFTER_MS,
            });
        }

        let (container_id, endpoint) = match (&container.container_id, &container.endpoint) {
            (Some(c), Some(e)) => (c.clone(), e.clone()),
            _ => {
                return Err(CoreError::SessionNotReady {
                    sandbox_id: sandbox_id.to_string(),
                    retry_after_ms: RETRY_AFTER_MS,
                })
            }
        };

        let kind = match container.runtime_kind.as_str() {
            "ship" => RuntimeKind::Ship,
            "gull" => RuntimeKind::Gull,
            other => {
                return Err(CoreError::Internal(format!("unknown runtime kind {other}")))
            }
        };

        let adapter = self.pool.get_or_create(&container_id, &endpoint, kind);
        let is_primary = ready.session.primary_container_id.as_deref() == Some(container_id.as_str());

        Ok(Routed {
            ready,
            container,
            adapter,
            is_primary,
        })
    }

    /// Map an adapter failure, degrading the session when a sidecar dropped
    /// its connection, and touch activity on success.
    async fn complete<T>(
        &self,
        owner: &str,
        sandbox_id: &str,
        routed: &Routed,
        result: bay_runtime::Result<T>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                self.sandbox_mgr.touch(sandbox_id, owner).await?;
                Ok(value)
            }
            Err(e) => {
                if matches!(e, RuntimeError::Unreachable(_) | RuntimeError::Timeout(_))
                    && !routed.is_primary
                {
                    warn!(
                        sandbox_id = %sandbox_id,
                        container = %routed.container.name,
                        "sidecar unreachable, degrading session"
                    );
                    let mut session = routed.ready.session.clone();
                    self.session_mgr
                        .mark_container_failed(&mut session, &routed.container.name)
                        .await?;
                    return Err(CoreError::SessionNotReady {
                        sandbox_id: sandbox_id.to_string(),
                        retry_after_ms: RETRY_AFTER_MS,
                    });
                }
                Err(CoreError::from_capability_error(e))
            }
        }
    }

    // ========================================================================
    // CODE EXECUTION
    // ========================================================================

    pub async fn exec_python(
        &self,
        owner: &str,
        sandbox_id: &str,
        code: &str,
        timeout_secs: Option<u64>,
    ) -> Result<ExecOutcome> {
        let timeout = Self::clamp_timeout(timeout_secs);
        let started_at = Utc::now();
        let timer = Instant::now();

        let routed = self.route(owner, sandbox_id, Capability::Python).await?;
        info!(sandbox_id = %sandbox_id, code_len = code.len(), "capability.python.exec");

        let result = routed.adapter.exec_python(code, timeout).await;
        let outcome = self.complete(owner, sandbox_id, &routed, result).await?;

        self.history
            .record(
                owner,
                sandbox_id,
                ExecType::Python,
                code,
                Some(outcome.output.clone()),
                outcome.error.clone(),
                outcome.exit_code,
                outcome.success,
                started_at,
                timer.elapsed().as_millis() as i64,
            )
            .await?;
        Ok(outcome)
    }

    pub async fn exec_shell(
        &self,
        owner: &str,
        sandbox_id: &str,
        command: &str,
        timeout_secs: Option<u64>,
        cwd: Option<&str>,
    ) -> Result<ExecOutcome> {
        if let Some(cwd) = cwd {
            validate_workspace_path(cwd)?;
        }
        let timeout = Self::clamp_timeout(timeout_secs);
        let started_at = Utc::now();
        let timer = Instant::now();

        let routed = self.route(owner, sandbox_id, Capability::Shell).await?;
        info!(sandbox_id = %sandbox_id, "capability.shell.exec");

        let result = routed.adapter.exec_shell(command, timeout, cwd).await;
        let outcome = self.complete(owner, sandbox_id, &routed, result).await?;

        self.history
            .record(
                owner,
                sandbox_id,
                ExecType::Shell,
                command,
                Some(outcome.output.clone()),
                outcome.error.clone(),
                outcome.exit_code,
                outcome.success,
                started_at,
                timer.elapsed().as_millis() as i64,
            )
            .await?;
        Ok(outcome)
    }

    // ========================================================================
    // FILESYSTEM
    // ========================================================================

    pub async fn read_file(&self, owner: &str, sandbox_id: &str, path: &str) -> Result<String> {
        validate_workspace_path(path)?;
        let routed = self.route(owner, sandbox_id, Capability::Filesystem).await?;
        let result = routed.adapter.read_file(path).await;
        self.complete(owner, sandbox_id, &routed, result).await
    }

    pub async fn write_file(
        &self,
        owner: &str,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<()> {
        validate_workspace_path(path)?;
        let routed = self.route(owner, sandbox_id, Capability::Filesystem).await?;
        let result = routed.adapter.write_file(path, content).await;
        self.complete(owner, sandbox_id, &routed, result).await
    }

    pub async fn list_files(
        &self,
        owner: &str,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>> {
        validate_workspace_path(path)?;
        let routed = self.route(owner, sandbox_id, Capability::Filesystem).await?;
        let result = routed.adapter.list_files(path).await;
        self.complete(owner, sandbox_id, &routed, result).await
    }

    pub async fn delete_file(&self, owner: &str, sandbox_id: &str, path: &str) -> Result<()> {
        validate_workspace_path(path)?;
        let routed = self.route(owner, sandbox_id, Capability::Filesystem).await?;
        let result = routed.adapter.delete_file(path).await;
        self.complete(owner, sandbox_id, &routed, result).await
    }

    pub async fn upload_file(
        &self,
        owner: &str,
        sandbox_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<()> {
        validate_workspace_path(path)?;
        let routed = self.route(owner, sandbox_id, Capability::Filesystem).await?;
        let result = routed.adapter.upload_file(path, bytes).await;
        self.complete(owner, sandbox_id, &routed, result).await
    }

    pub async fn download_file(
        &self,
        owner: &str,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<u8>> {
        validate_workspace_path(path)?;
        let routed = self.route(owner, sandbox_id, Capability::Filesystem).await?;
        let result = routed.adapter.download_file(path).await;
        self.complete(owner, sandbox_id, &routed, result).await
    }

    // ========================================================================
    // BROWSER
    // ========================================================================

    /// Single browser command. The command string goes through verbatim; the
    /// runtime owns splitting and flag injection.
    pub async fn exec_browser(
        &self,
        owner: &str,
        sandbox_id: &str,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> Result<BrowserStep> {
        let timeout = Self::clamp_timeout(timeout_secs);
        let started_at = Utc::now();
        let timer = Instant::now();

        let routed = self.route(owner, sandbox_id, Capability::Browser).await?;
        info!(sandbox_id = %sandbox_id, "capability.browser.exec");

        let result = routed.adapter.exec_browser(command, timeout).await;
        let step = self.complete(owner, sandbox_id, &routed, result).await?;

        self.history
            .record(
                owner,
                sandbox_id,
                ExecType::Browser,
                command,
                Some(step.output.clone()),
                step.error.clone(),
                None,
                step.success,
                started_at,
                timer.elapsed().as_millis() as i64,
            )
            .await?;
        Ok(step)
    }

    /// Ordered browser batch; one history row for the whole batch.
    pub async fn exec_browser_batch(
        &self,
        owner: &str,
        sandbox_id: &str,
        commands: &[String],
        timeout_secs: Option<u64>,
        stop_on_error: bool,
    ) -> Result<BrowserBatchOutcome> {
        if commands.is_empty() {
            return Err(CoreError::Validation(
                "browser batch requires at least one command".to_string(),
            ));
        }
        let timeout = Self::clamp_timeout(timeout_secs);
        let started_at = Utc::now();
        let timer = Instant::now();

        let routed = self.route(owner, sandbox_id, Capability::Browser).await?;
        info!(
            sandbox_id = %sandbox_id,
            steps = commands.len(),
            stop_on_error,
            "capability.browser.exec_batch"
        );

        let result = routed
            .adapter
            .exec_browser_batch(commands, timeout, stop_on_error)
            .await;
        let outcome = self.complete(owner, sandbox_id, &routed, result).await?;

        self.history
            .record(
                owner,
                sandbox_id,
                ExecType::BrowserBatch,
                &serde_json::to_string(commands).unwrap_or_default(),
                serde_json::to_string(&outcome.steps).ok(),
                None,
                None,
                outcome.success,
                started_at,
                timer.elapsed().as_millis() as i64,
            )
            .await?;
        Ok(outcome)
    }
}
