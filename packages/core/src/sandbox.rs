// ABOUTME: SandboxManager - sandbox lifecycle, TTL, status, per-sandbox locking
// ABOUTME: All mutating paths serialize on the sandbox's named lock

use crate::cargo::CargoManager;
use crate::error::{CoreError, Result};
use crate::ids::new_id;
use crate::locks::LockTable;
use crate::profiles::{Profile, ProfileRegistry};
use crate::session::SessionManager;
use bay_storage::{
    Cargo, CargoKind, Sandbox, SandboxDesiredState, SandboxStatus, Session, SessionContainer,
    SessionStore, SandboxStore,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

/// A converged, ready-to-route session with its container roster.
#[derive(Debug)]
pub struct ReadySession {
    pub session: Session,
    pub containers: Vec<SessionContainer>,
}

/// One sandbox plus its computed status, as the listing returns it.
pub struct SandboxView {
    pub sandbox: Sandbox,
    pub status: SandboxStatus,
}

pub struct SandboxManager {
    driver: Arc<dyn bay_driver::Driver>,
    profiles: Arc<ProfileRegistry>,
    sandboxes: SandboxStore,
    sessions: SessionStore,
    cargo_mgr: Arc<CargoManager>,
    session_mgr: Arc<SessionManager>,
    locks: Arc<LockTable>,
}

impl SandboxManager {
    pub fn new(
        driver: Arc<dyn bay_driver::Driver>,
        profiles: Arc<ProfileRegistry>,
        sandboxes: SandboxStore,
        sessions: SessionStore,
        cargo_mgr: Arc<CargoManager>,
        session_mgr: Arc<SessionManager>,
        locks: Arc<LockTable>,
    ) -> Self {
        Self {
            driver,
            profiles,
            sandboxes,
            sessions,
            cargo_mgr,
            session_mgr,
            locks,
        }
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    fn profile(&self, profile_id: &str) -> Result<Profile> {
        self.profiles
            .get(profile_id)
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("Invalid profile: {profile_id}")))
    }

    /// Create a sandbox. Without `cargo_id` a managed cargo is created;
    /// with one, the referenced external cargo is attached.
    ///
    /// `ttl_seconds = None` means no expiry. Zero and negative values are
    /// rejected rather than silently aliased to infinite.
    pub async fn create(
        &self,
        owner: &str,
        profile_id: &str,
        cargo_id: Option<&str>,
        ttl_seconds: Option<i64>,
    ) -> Result<Sandbox> {
        self.profile(profile_id)?;

        if let Some(ttl) = ttl_seconds {
            if ttl <= 0 {
                return Err(CoreError::Validation(
                    "ttl_seconds must be positive; omit it for no expiry".to_string(),
                ));
            }
        }

        let sandbox_id = new_id("sandbox");
        info!(sandbox_id = %sandbox_id, owner = %owner, profile_id = %profile_id, "sandbox.create");

        let cargo = match cargo_id {
            Some(cargo_id) => {
                let cargo = self.cargo_mgr.get(cargo_id, owner).await?;
                if cargo.kind == CargoKind::Managed {
                    return Err(CoreError::Conflict(format!(
                        "cargo {cargo_id} is managed by another sandbox"
                    )));
                }
                cargo
            }
            None => {
                self.cargo_mgr
                    .create(owner, CargoKind::Managed, Some(sandbox_id.clone()))
                    .await?
            }
        };

        let now = Utc::now();
        let sandbox = Sandbox {
            id: sandbox_id,
            owner: owner.to_string(),
            profile_id: profile_id.to_string(),
            cargo_id: cargo.id.clone(),
            current_session_id: None,
            desired_state: SandboxDesiredState::Running,
            expires_at: ttl_seconds.map(|ttl| now + Duration::seconds(ttl)),
            idle_expires_at: None,
            last_activity: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
        };
        self.sandboxes.create(&sandbox).await?;
        Ok(sandbox)
    }

    pub async fn get(&self, sandbox_id: &str, owner: &str) -> Result<Sandbox> {
        self.sandboxes
            .get(sandbox_id, owner)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Sandbox not found: {sandbox_id}")))
    }

    /// Sandbox plus computed status, from one captured `now`.
    pub async fn get_view(&self, sandbox_id: &str, owner: &str) -> Result<SandboxView> {
        let sandbox = self.get(sandbox_id, owner).await?;
        let session = self.current_session(&sandbox).await?;
        let now = Utc::now();
        let status = sandbox.compute_status(now, session.as_ref());
        Ok(SandboxView { sandbox, status })
    }

    pub async fn list(
        &self,
        owner: &str,
        status_filter: Option<SandboxStatus>,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<Vec<SandboxView>> {
        let now = Utc::now();
        let sandboxes = self.sandboxes.list(owner, limit, cursor).await?;

        let mut views = Vec::with_capacity(sandboxes.len());
        for sandbox in sandboxes {
            let session = self.current_session(&sandbox).await?;
            let status = sandbox.compute_status(now, session.as_ref());
            if status_filter.is_none() || status_filter == Some(status) {
                views.push(SandboxView { sandbox, status });
            }
        }
        Ok(views)
    }

    pub async fn current_session(&self, sandbox: &Sandbox) -> Result<Option<Session>> {
        match &sandbox.current_session_id {
            Some(session_id) => self.session_mgr.get(session_id).await,
            None => Ok(None),
        }
    }

    /// Converge the sandbox to a ready session. Serialized per sandbox; the
    /// N-th concurrent caller observes the session the first one built.
    ///
    /// The critical section runs in a spawned task: a caller that hangs up
    /// mid-start does not abort the container launch, so the next request
    /// finds a ready session instead of a half-built one.
    pub async fn ensure_running(self: &Arc<Self>, sandbox_id: &str, owner: &str) -> Result<ReadySession> {
        let this = self.clone();
        let sandbox_id = sandbox_id.to_string();
        let owner = owner.to_string();

        tokio::spawn(async move { this.ensure_running_locked(&sandbox_id, &owner).await })
            .await
            .map_err(|e| CoreError::Internal(format!("ensure_running task failed: {e}")))?
    }

    async fn ensure_running_locked(&self, sandbox_id: &str, owner: &str) -> Result<ReadySession> {
        let lock = self.locks.acquire(sandbox_id);
        let _guard = lock.lock().await;

        // Re-fetch under the lock: another caller may have converged,
        // stopped, or deleted while we waited.
        let mut sandbox = self.get(sandbox_id, owner).await?;
        let now = Utc::now();
        if sandbox.is_expired(now) {
            return Err(CoreError::SandboxExpired(sandbox_id.to_string()));
        }

        let profile = self.profile(&sandbox.profile_id)?;
        let cargo = self.cargo_mgr.get_by_id(&sandbox.cargo_id).await?;

        let mut session = match self.current_session(&sandbox).await? {
            Some(session)
                if session.desired_state != bay_storage::SessionState::Stopped
                    && !session.observed_state.is_terminal() =>
            {
                session
            }
            _ => {
                let session = self.session_mgr.create(&sandbox, &profile).await?;
                sandbox.current_session_id = Some(session.id.clone());
                self.sandboxes.save(&mut sandbox).await?;
                session
            }
        };

        self.session_mgr
            .converge(&sandbox, &cargo, &profile, &mut session)
            .await?;

        // Lazy start implies running again after an explicit stop.
        sandbox.desired_state = SandboxDesiredState::Running;
        sandbox.current_session_id = Some(session.id.clone());
        let now = Utc::now();
        sandbox.last_activity = now;
        sandbox.idle_expires_at = Some(now + Duration::seconds(profile.idle_timeout_seconds));
        self.sandboxes.save(&mut sandbox).await?;

        let containers = self.session_mgr.containers(&session.id).await?;
        Ok(ReadySession {
            session,
            containers,
        })
    }

    /// Refresh the idle deadline without starting compute or touching
    /// expires-at.
    pub async fn keepalive(&self, sandbox_id: &str, owner: &str) -> Result<()> {
        let lock = self.locks.acquire(sandbox_id);
        let _guard = lock.lock().await;

        let mut sandbox = self.get(sandbox_id, owner).await?;
        let profile = self.profile(&sandbox.profile_id)?;

        let now = Utc::now();
        sandbox.last_activity = now;
        sandbox.idle_expires_at = Some(now + Duration::seconds(profile.idle_timeout_seconds));
        self.sandboxes.save(&mut sandbox).await?;

        if let Some(session_id) = sandbox.current_session_id.clone() {
            self.session_mgr.touch(&session_id).await?;
        }

        info!(sandbox_id = %sandbox_id, "sandbox.keepalive");
        Ok(())
    }

    /// Record activity after a successful capability call.
    pub async fn touch(&self, sandbox_id: &str, owner: &str) -> Result<()> {
        self.keepalive(sandbox_id, owner).await
    }

    /// Extend expires-at by `extend_by` seconds from max(old, now).
    pub async fn extend_ttl(
        &self,
        sandbox_id: &str,
        owner: &str,
        extend_by: i64,
    ) -> Result<Sandbox> {
        if extend_by <= 0 {
            return Err(CoreError::Validation(
                "extend_by must be a positive number of seconds".to_string(),
            ));
        }

        let lock = self.locks.acquire(sandbox_id);
        let _guard = lock.lock().await;

        let mut sandbox = self.get(sandbox_id, owner).await?;
        let now = Utc::now();

        let Some(old) = sandbox.expires_at else {
            return Err(CoreError::SandboxTtlInfinite(sandbox_id.to_string()));
        };
        if old <= now {
            return Err(CoreError::SandboxExpired(sandbox_id.to_string()));
        }

        let base = if old > now { old } else { now };
        sandbox.expires_at = Some(base + Duration::seconds(extend_by));
        self.sandboxes.save(&mut sandbox).await?;

        info!(
            sandbox_id = %sandbox_id,
            expires_at = %sandbox.expires_at.map(|e| e.to_rfc3339()).unwrap_or_default(),
            "sandbox.extend_ttl"
        );
        Ok(sandbox)
    }

    /// Stop compute, keep the cargo. Idempotent: stopping an idle sandbox
    /// succeeds.
    pub async fn stop(&self, sandbox_id: &str, owner: &str) -> Result<()> {
        let lock = self.locks.acquire(sandbox_id);
        let _guard = lock.lock().await;
        self.stop_locked(sandbox_id, owner).await
    }

    async fn stop_locked(&self, sandbox_id: &str, owner: &str) -> Result<()> {
        let Some(mut sandbox) = self.sandboxes.get(sandbox_id, owner).await? else {
            // Already deleted; nothing to stop.
            return Ok(());
        };

        info!(sandbox_id = %sandbox_id, "sandbox.stop");

        for mut session in self.sessions.list_for_sandbox(sandbox_id).await? {
            if !session.observed_state.is_terminal() {
                self.session_mgr.stop(&mut session).await?;
            }
        }

        sandbox.desired_state = SandboxDesiredState::Stopped;
        sandbox.current_session_id = None;
        sandbox.idle_expires_at = None;
        self.sandboxes.save(&mut sandbox).await?;
        Ok(())
    }

    /// Stop a session only if it is still idle when re-checked under the
    /// lock. Returns true when compute was reclaimed. A keepalive that lands
    /// while the reaper is scanning wins.
    pub async fn stop_if_idle(&self, sandbox_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let lock = self.locks.acquire(sandbox_id);
        let _guard = lock.lock().await;

        let Some(mut sandbox) = self.sandboxes.get_by_id(sandbox_id).await? else {
            return Ok(false);
        };
        if sandbox.deleted_at.is_some() {
            return Ok(false);
        }
        let Some(session_id) = sandbox.current_session_id.clone() else {
            return Ok(false);
        };
        let Some(mut session) = self.session_mgr.get(&session_id).await? else {
            return Ok(false);
        };

        if session.observed_state.is_terminal() || session.idle_deadline() > now {
            return Ok(false);
        }

        info!(sandbox_id = %sandbox_id, session_id = %session_id, "sandbox.idle_reap");
        self.session_mgr.stop(&mut session).await?;

        sandbox.current_session_id = None;
        sandbox.idle_expires_at = None;
        self.sandboxes.save(&mut sandbox).await?;
        Ok(true)
    }

    /// Soft-delete the sandbox and cascade its managed cargo. Idempotent.
    pub async fn delete(&self, sandbox_id: &str, owner: &str) -> Result<()> {
        let Some(existing) = self.sandboxes.get_any(sandbox_id, owner).await? else {
            return Err(CoreError::NotFound(format!(
                "Sandbox not found: {sandbox_id}"
            )));
        };
        if existing.deleted_at.is_some() {
            return Ok(());
        }

        {
            let lock = self.locks.acquire(sandbox_id);
            let _guard = lock.lock().await;

            let Some(mut sandbox) = self.sandboxes.get(sandbox_id, owner).await? else {
                return Ok(());
            };

            info!(sandbox_id = %sandbox_id, owner = %owner, "sandbox.delete");

            for mut session in self.sessions.list_for_sandbox(sandbox_id).await? {
                if !session.observed_state.is_terminal() {
                    self.session_mgr.stop(&mut session).await?;
                }
            }

            let cargo_id = sandbox.cargo_id.clone();
            sandbox.desired_state = SandboxDesiredState::Deleted;
            sandbox.current_session_id = None;
            sandbox.idle_expires_at = None;
            sandbox.deleted_at = Some(Utc::now());
            self.sandboxes.save(&mut sandbox).await?;

            let cargo: Option<Cargo> = self.cargo_mgr.get_by_id(&cargo_id).await.ok();
            if let Some(cargo) = cargo {
                if cargo.kind == CargoKind::Managed && cargo.deleted_at.is_none() {
                    self.cargo_mgr.delete(&cargo.id, owner, true).await?;
                }
            }
        }

        // The entry is recreated harmlessly if a stale caller races us.
        self.locks.remove(sandbox_id);
        Ok(())
    }

    /// Container logs of the current primary, for diagnostics.
    pub async fn primary_logs(&self, sandbox_id: &str, owner: &str, tail: usize) -> Result<String> {
        let sandbox = self.get(sandbox_id, owner).await?;
        let Some(session) = self.current_session(&sandbox).await? else {
            return Ok(String::new());
        };
        match &session.primary_container_id {
            Some(container_id) => Ok(self.driver.logs(container_id, tail).await?),
            None => Ok(String::new()),
        }
    }
}
