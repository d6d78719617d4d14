// ABOUTME: Persistent entity models for Bay orchestration state
// ABOUTME: Sandbox/Session/Cargo state machines plus history and skill artifacts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Invalid {kind} value: {value}")]
pub struct InvalidValue {
    pub kind: &'static str,
    pub value: String,
}

/// Caller intent for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxDesiredState {
    Running,
    Stopped,
    Deleted,
}

impl SandboxDesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "deleted" => Ok(Self::Deleted),
            _ => Err(InvalidValue {
                kind: "sandbox desired state",
                value: s.to_string(),
            }),
        }
    }
}

/// Externally visible sandbox status, computed from observed reality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Idle,
    Starting,
    Ready,
    Failed,
    Degraded,
    Expired,
    Deleted,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Degraded => "degraded",
            Self::Expired => "expired",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "idle" => Ok(Self::Idle),
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "degraded" => Ok(Self::Degraded),
            "expired" => Ok(Self::Expired),
            "deleted" => Ok(Self::Deleted),
            _ => Err(InvalidValue {
                kind: "sandbox status",
                value: s.to_string(),
            }),
        }
    }
}

/// Session lifecycle state, both desired and observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "pending" => Ok(Self::Pending),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "degraded" => Ok(Self::Degraded),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            _ => Err(InvalidValue {
                kind: "session state",
                value: s.to_string(),
            }),
        }
    }

    /// Terminal states: the session is replaced, never resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// The stable external handle callers hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub owner: String,
    pub profile_id: String,
    pub cargo_id: String,
    pub current_session_id: Option<String>,
    pub desired_state: SandboxDesiredState,
    pub expires_at: Option<DateTime<Utc>>,
    pub idle_expires_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Sandbox {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    /// Status is a pure function of (deleted_at, expires_at, current session).
    /// `now` must be captured once per request by the caller.
    pub fn compute_status(&self, now: DateTime<Utc>, session: Option<&Session>) -> SandboxStatus {
        if self.deleted_at.is_some() {
            return SandboxStatus::Deleted;
        }
        if self.is_expired(now) {
            return SandboxStatus::Expired;
        }
        let Some(session) = session else {
            return SandboxStatus::Idle;
        };
        match session.observed_state {
            SessionState::Stopped | SessionState::Stopping => SandboxStatus::Idle,
            SessionState::Pending | SessionState::Starting => SandboxStatus::Starting,
            SessionState::Running => {
                if session.ready_at.is_some() {
                    SandboxStatus::Ready
                } else {
                    SandboxStatus::Starting
                }
            }
            SessionState::Degraded => SandboxStatus::Degraded,
            SessionState::Failed => SandboxStatus::Failed,
        }
    }
}

/// The ephemeral container group realizing a sandbox's compute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub sandbox_id: String,
    pub desired_state: SessionState,
    pub observed_state: SessionState,
    pub primary_container_id: Option<String>,
    pub endpoint: Option<String>,
    pub network_id: Option<String>,
    pub idle_timeout_seconds: i64,
    pub last_activity: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Session {
    pub fn is_ready(&self) -> bool {
        self.observed_state == SessionState::Running && self.endpoint.is_some()
    }

    pub fn idle_deadline(&self) -> DateTime<Utc> {
        self.last_activity + chrono::Duration::seconds(self.idle_timeout_seconds)
    }
}

/// Observed state of one container within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerObservedState {
    Pending,
    Running,
    Failed,
    Stopped,
}

impl ContainerObservedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(InvalidValue {
                kind: "container observed state",
                value: s.to_string(),
            }),
        }
    }
}

/// Per-container record of a (possibly multi-container) session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContainer {
    pub session_id: String,
    pub name: String,
    pub role: String,
    pub image: String,
    pub runtime_kind: String,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub capabilities: Vec<String>,
    pub observed_state: ContainerObservedState,
    pub position: i64,
}

/// Persistent volume kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CargoKind {
    Managed,
    External,
}

impl CargoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::External => "external",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "managed" => Ok(Self::Managed),
            "external" => Ok(Self::External),
            _ => Err(InvalidValue {
                kind: "cargo kind",
                value: s.to_string(),
            }),
        }
    }
}

/// A persistent data volume, managed (owned by one sandbox) or external.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cargo {
    pub id: String,
    pub owner: String,
    pub backend_handle: String,
    pub kind: CargoKind,
    pub mount_path: String,
    pub managed_by_sandbox_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: i64,
}

/// Idempotency record lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    InProgress,
    Complete,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            _ => Err(InvalidValue {
                kind: "idempotency status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub owner: String,
    pub key: String,
    pub scope: String,
    pub fingerprint: String,
    pub status: IdempotencyStatus,
    pub response_status: Option<i64>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Kind of capability invocation recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecType {
    Python,
    Shell,
    Browser,
    BrowserBatch,
}

impl ExecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Shell => "shell",
            Self::Browser => "browser",
            Self::BrowserBatch => "browser_batch",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "python" => Ok(Self::Python),
            "shell" => Ok(Self::Shell),
            "browser" => Ok(Self::Browser),
            "browser_batch" => Ok(Self::BrowserBatch),
            _ => Err(InvalidValue {
                kind: "exec type",
                value: s.to_string(),
            }),
        }
    }
}

/// One capability invocation. Immutable except for the annotation fields
/// (description, tags, notes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub owner: String,
    pub sandbox_id: String,
    pub exec_type: ExecType,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub success: bool,
    pub duration_ms: i64,
    pub started_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillCandidateStatus {
    Draft,
    Evaluating,
    Evaluated,
    Promoted,
    Rejected,
}

impl SkillCandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Evaluating => "evaluating",
            Self::Evaluated => "evaluated",
            Self::Promoted => "promoted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "draft" => Ok(Self::Draft),
            "evaluating" => Ok(Self::Evaluating),
            "evaluated" => Ok(Self::Evaluated),
            "promoted" => Ok(Self::Promoted),
            "rejected" => Ok(Self::Rejected),
            _ => Err(InvalidValue {
                kind: "skill candidate status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillCandidate {
    pub id: String,
    pub skill_key: String,
    pub source_execution_ids: Vec<String>,
    /// Reference to a stored payload blob, if the candidate carries one.
    pub payload_ref: Option<String>,
    pub summary: Option<String>,
    pub status: SkillCandidateStatus,
    pub latest_score: Option<f64>,
    pub latest_pass: Option<bool>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub promotion_release_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    pub delete_reason: Option<String>,
}

impl SkillCandidate {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEvaluation {
    pub id: String,
    pub candidate_id: String,
    pub passed: bool,
    pub score: Option<f64>,
    pub report: Option<String>,
    pub evaluated_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillReleaseStage {
    Canary,
    Stable,
}

impl SkillReleaseStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Canary => "canary",
            Self::Stable => "stable",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvalidValue> {
        match s {
            "canary" => Ok(Self::Canary),
            "stable" => Ok(Self::Stable),
            _ => Err(InvalidValue {
                kind: "skill release stage",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRelease {
    pub id: String,
    pub skill_key: String,
    pub candidate_id: String,
    pub version: i64,
    pub stage: SkillReleaseStage,
    pub is_active: bool,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub promoted_by: Option<String>,
    pub promoted_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    pub delete_reason: Option<String>,
}

impl SkillRelease {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An opaque payload blob referenced by skill candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillPayload {
    pub payload_ref: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}
