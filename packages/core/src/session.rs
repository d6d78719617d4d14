// ABOUTME: SessionManager - converges a sandbox's session to running
// ABOUTME: Active health probe, multi-container orchestration, readiness polling, rollback

use crate::error::{CoreError, Result};
use crate::ids::new_id;
use crate::profiles::{Profile, ProfileContainer};
use bay_driver::{
    ContainerState, Driver, LaunchSpec, VolumeMount, LABEL_OWNER, LABEL_ROLE, LABEL_SANDBOX_ID,
    LABEL_SESSION_ID,
};
use bay_runtime::{AdapterPool, RuntimeError};
use bay_storage::{
    Cargo, ContainerObservedState, Sandbox, Session, SessionContainer, SessionState, SessionStore,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Readiness polling knobs. Production values follow the converge contract;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub readiness_deadline: Duration,
    pub readiness_initial_backoff: Duration,
    pub readiness_max_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            readiness_deadline: Duration::from_secs(120),
            readiness_initial_backoff: Duration::from_millis(250),
            readiness_max_backoff: Duration::from_secs(5),
        }
    }
}

/// Retry hint returned with session-not-ready.
const RETRY_AFTER_MS: u64 = 1000;

pub struct SessionManager {
    driver: Arc<dyn Driver>,
    sessions: SessionStore,
    pool: Arc<AdapterPool>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        driver: Arc<dyn Driver>,
        sessions: SessionStore,
        pool: Arc<AdapterPool>,
        config: SessionConfig,
    ) -> Self {
        Self {
            driver,
            sessions,
            pool,
            config,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).await?)
    }

    pub async fn containers(&self, session_id: &str) -> Result<Vec<SessionContainer>> {
        Ok(self.sessions.containers(session_id).await?)
    }

    /// Create a new pending session record with its container roster.
    /// Does not touch the backend.
    pub async fn create(&self, sandbox: &Sandbox, profile: &Profile) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: new_id("sess"),
            sandbox_id: sandbox.id.clone(),
            desired_state: SessionState::Running,
            observed_state: SessionState::Pending,
            primary_container_id: None,
            endpoint: None,
            network_id: None,
            idle_timeout_seconds: profile.idle_timeout_seconds,
            last_activity: now,
            ready_at: None,
            failed_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        info!(
            session_id = %session.id,
            sandbox_id = %sandbox.id,
            profile_id = %profile.id,
            "session.create"
        );

        self.sessions.create(&session).await?;

        let roster: Vec<SessionContainer> = profile
            .containers
            .iter()
            .enumerate()
            .map(|(position, c)| SessionContainer {
                session_id: session.id.clone(),
                name: c.name.clone(),
                role: c.role.as_str().to_string(),
                image: c.image.clone(),
                runtime_kind: c.runtime.as_str().to_string(),
                container_id: None,
                endpoint: None,
                capabilities: c.capabilities.iter().map(|cap| cap.as_str().to_string()).collect(),
                observed_state: ContainerObservedState::Pending,
                position: position as i64,
            })
            .collect();
        self.sessions.replace_containers(&session.id, &roster).await?;

        Ok(session)
    }

    /// Converge the session to observed-state running with a validated
    /// endpoint. Idempotent; must run under the sandbox's lock.
    ///
    /// An externally killed container is detected by the active probe and
    /// invisibly replaced. At most one such recovery happens per call; if the
    /// rebuilt session misses its readiness deadline the caller gets a
    /// retryable session-not-ready instead of a loop.
    pub async fn converge(
        &self,
        sandbox: &Sandbox,
        cargo: &Cargo,
        profile: &Profile,
        session: &mut Session,
    ) -> Result<()> {
        info!(
            session_id = %session.id,
            observed = %session.observed_state.as_str(),
            "session.converge"
        );

        if matches!(
            session.observed_state,
            SessionState::Running | SessionState::Degraded
        ) {
            self.probe(sandbox, cargo, profile, session).await?;
        }

        if session.observed_state == SessionState::Pending {
            self.launch(sandbox, cargo, profile, session).await?;
        }

        if session.observed_state == SessionState::Starting {
            self.wait_ready(profile, session).await?;
        }

        Ok(())
    }

    /// Active probe of the primary container. Running keeps the session (and
    /// heals degraded sidecars); anything else tears down and resets to
    /// pending so the launch path rebuilds from cold.
    async fn probe(
        &self,
        sandbox: &Sandbox,
        cargo: &Cargo,
        profile: &Profile,
        session: &mut Session,
    ) -> Result<()> {
        let Some(primary_id) = session.primary_container_id.clone() else {
            // Inconsistent row: claimed running without a container.
            session.observed_state = SessionState::Pending;
            session.endpoint = None;
            session.ready_at = None;
            self.sessions.save(session).await?;
            return Ok(());
        };

        match self.driver.status(&primary_id).await {
            Ok(ContainerState::Running) => {
                if session.observed_state == SessionState::Degraded {
                    self.recover_sidecars(sandbox, cargo, profile, session).await?;
                }
                Ok(())
            }
            Ok(ContainerState::Exited)
            | Ok(ContainerState::NotFound)
            | Ok(ContainerState::Unknown) => {
                info!(
                    session_id = %session.id,
                    container_id = %primary_id,
                    "primary container gone, healing session"
                );
                self.teardown_backend(session).await?;
                session.observed_state = SessionState::Pending;
                session.primary_container_id = None;
                session.endpoint = None;
                session.network_id = None;
                session.ready_at = None;
                self.sessions.save(session).await?;
                Ok(())
            }
            Err(e) if e.retryable() => Err(CoreError::SessionNotReady {
                sandbox_id: session.sandbox_id.clone(),
                retry_after_ms: RETRY_AFTER_MS,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn launch_spec(
        &self,
        sandbox: &Sandbox,
        cargo: &Cargo,
        session: &Session,
        container: &ProfileContainer,
        network: Option<String>,
    ) -> LaunchSpec {
        let mut labels = HashMap::new();
        labels.insert(LABEL_OWNER.to_string(), sandbox.owner.clone());
        labels.insert(LABEL_SANDBOX_ID.to_string(), sandbox.id.clone());
        labels.insert(LABEL_SESSION_ID.to_string(), session.id.clone());
        labels.insert(LABEL_ROLE.to_string(), container.role.as_str().to_string());

        let mut env = container.env.clone();
        env.insert("BAY_SANDBOX_ID".to_string(), sandbox.id.clone());
        env.insert("BAY_SESSION_ID".to_string(), session.id.clone());
        env.insert("BAY_WORKSPACE_PATH".to_string(), cargo.mount_path.clone());

        LaunchSpec {
            name: format!("bay-{}-{}", session.id, container.name),
            image: container.image.clone(),
            env,
            cpus: container.cpus,
            memory_mb: container.memory_mb,
            runtime_port: container.runtime_port,
            volume: VolumeMount {
                handle: cargo.backend_handle.clone(),
                mount_path: cargo.mount_path.clone(),
            },
            network,
            labels,
        }
    }

    /// Cold start: create and start the container group, record endpoints,
    /// move to starting. Any failure rolls every created resource back and
    /// marks the session failed (the next converge builds a fresh session).
    async fn launch(
        &self,
        sandbox: &Sandbox,
        cargo: &Cargo,
        profile: &Profile,
        session: &mut Session,
    ) -> Result<()> {
        session.desired_state = SessionState::Running;

        let network = if profile.is_multi_container() {
            let network = self.driver.create_network(&session.id).await?;
            session.network_id = Some(network.clone());
            self.sessions.save(session).await?;
            Some(network)
        } else {
            None
        };

        let specs: Vec<LaunchSpec> = profile
            .containers
            .iter()
            .map(|c| self.launch_spec(sandbox, cargo, session, c, network.clone()))
            .collect();

        let created = match self.driver.create_multi(&specs).await {
            Ok(created) => created,
            Err(e) => {
                self.fail_session(session, &format!("container create failed: {e}"))
                    .await?;
                return Err(e.into());
            }
        };

        // Start in roster (dependency) order; create_multi preserves it.
        for (container, launched) in profile.containers.iter().zip(created.iter()) {
            match self.driver.start_container(&launched.container_id).await {
                Ok(endpoint) => {
                    self.sessions
                        .update_container_state(
                            &session.id,
                            &container.name,
                            Some(&launched.container_id),
                            Some(&endpoint),
                            ContainerObservedState::Running,
                        )
                        .await?;
                    if container.name == profile.primary_container().name {
                        session.primary_container_id = Some(launched.container_id.clone());
                        session.endpoint = Some(endpoint);
                    }
                }
                Err(e) => {
                    for rollback in &created {
                        if let Err(cleanup) =
                            self.driver.destroy_container(&rollback.container_id).await
                        {
                            warn!(
                                container_id = %rollback.container_id,
                                error = %cleanup,
                                "rollback destroy failed during launch"
                            );
                        }
                    }
                    self.fail_session(session, &format!("container start failed: {e}"))
                        .await?;
                    return Err(e.into());
                }
            }
        }

        session.observed_state = SessionState::Starting;
        self.sessions.save(session).await?;
        Ok(())
    }

    /// Poll the primary runtime's meta probe with exponential backoff until
    /// the readiness deadline. First success validates the meta against the
    /// profile and flips the session to running.
    async fn wait_ready(&self, profile: &Profile, session: &mut Session) -> Result<()> {
        let primary = profile.primary_container();
        let (container_id, endpoint) = match (&session.primary_container_id, &session.endpoint) {
            (Some(c), Some(e)) => (c.clone(), e.clone()),
            _ => {
                return Err(CoreError::Internal(format!(
                    "session {} is starting without an endpoint",
                    session.id
                )))
            }
        };

        let adapter = self
            .pool
            .get_or_create(&container_id, &endpoint, primary.runtime);

        let required: Vec<String> = primary
            .capabilities
            .iter()
            .map(|c| c.as_str().to_string())
            .collect();

        let deadline = Instant::now() + self.config.readiness_deadline;
        let mut backoff = self.config.readiness_initial_backoff;

        loop {
            match adapter.meta().await {
                Ok(meta) => {
                    if let Err(e) = meta.validate(&required) {
                        self.fail_session(session, &e.to_string()).await?;
                        return Err(CoreError::RuntimeFailed(e.to_string()));
                    }
                    let now = Utc::now();
                    session.observed_state = SessionState::Running;
                    session.ready_at = Some(now);
                    session.last_activity = now;
                    self.sessions.save(session).await?;
                    info!(session_id = %session.id, endpoint = %endpoint, "session.ready");
                    return Ok(());
                }
                Err(e) if e.retryable() => {
                    if Instant::now() >= deadline {
                        // Leave the session in starting with its endpoint; the
                        // caller retries and resumes polling from here.
                        return Err(CoreError::SessionNotReady {
                            sandbox_id: session.sandbox_id.clone(),
                            retry_after_ms: RETRY_AFTER_MS,
                        });
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.readiness_max_backoff);
                }
                Err(e) => {
                    let reason = match &e {
                        RuntimeError::Upstream { status, message } => {
                            format!("runtime rejected readiness probe ({status}): {message}")
                        }
                        other => other.to_string(),
                    };
                    self.fail_session(session, &reason).await?;
                    return Err(CoreError::RuntimeFailed(reason));
                }
            }
        }
    }

    /// Recreate failed non-primary containers. Runs only when the primary is
    /// healthy; failures keep the session degraded rather than erroring the
    /// request that triggered recovery.
    async fn recover_sidecars(
        &self,
        sandbox: &Sandbox,
        cargo: &Cargo,
        profile: &Profile,
        session: &mut Session,
    ) -> Result<()> {
        let primary_name = profile.primary_container().name.clone();
        let roster = self.sessions.containers(&session.id).await?;
        let mut all_running = true;

        for row in roster.iter().filter(|r| r.name != primary_name) {
            if row.observed_state == ContainerObservedState::Running {
                continue;
            }
            let Some(spec_container) = profile.containers.iter().find(|c| c.name == row.name)
            else {
                continue;
            };

            if let Some(old_id) = &row.container_id {
                self.pool.invalidate_container(old_id);
                if let Err(e) = self.driver.destroy_container(old_id).await {
                    warn!(container_id = %old_id, error = %e, "sidecar teardown failed");
                }
            }

            let spec = self.launch_spec(
                sandbox,
                cargo,
                session,
                spec_container,
                session.network_id.clone(),
            );
            let outcome = async {
                let container_id = self.driver.create_container(&spec).await?;
                let endpoint = self.driver.start_container(&container_id).await?;
                Ok::<_, bay_driver::DriverError>((container_id, endpoint))
            }
            .await;

            match outcome {
                Ok((container_id, endpoint)) => {
                    self.sessions
                        .update_container_state(
                            &session.id,
                            &row.name,
                            Some(&container_id),
                            Some(&endpoint),
                            ContainerObservedState::Running,
                        )
                        .await?;
                    info!(session_id = %session.id, container = %row.name, "sidecar recovered");
                }
                Err(e) => {
                    warn!(
                        session_id = %session.id,
                        container = %row.name,
                        error = %e,
                        "sidecar recovery failed"
                    );
                    all_running = false;
                }
            }
        }

        if all_running && session.observed_state == SessionState::Degraded {
            session.observed_state = SessionState::Running;
            self.sessions.save(session).await?;
        }
        Ok(())
    }

    /// Record that a non-primary container is unhealthy; the session drops to
    /// degraded and the next request needing that capability recovers it.
    pub async fn mark_container_failed(
        &self,
        session: &mut Session,
        container_name: &str,
    ) -> Result<()> {
        let roster = self.sessions.containers(&session.id).await?;
        let Some(row) = roster.iter().find(|r| r.name == container_name) else {
            return Ok(());
        };
        if let Some(container_id) = &row.container_id {
            self.pool.invalidate_container(container_id);
        }
        self.sessions
            .update_container_state(
                &session.id,
                container_name,
                row.container_id.as_deref(),
                row.endpoint.as_deref(),
                ContainerObservedState::Failed,
            )
            .await?;

        if session.observed_state == SessionState::Running {
            session.observed_state = SessionState::Degraded;
            self.sessions.save(session).await?;
        }
        Ok(())
    }

    /// Stop the session: reclaim all compute, keep the cargo. Idempotent.
    pub async fn stop(&self, session: &mut Session) -> Result<()> {
        if session.observed_state == SessionState::Stopped {
            return Ok(());
        }
        info!(session_id = %session.id, "session.stop");

        session.desired_state = SessionState::Stopped;
        session.observed_state = SessionState::Stopping;
        self.sessions.save(session).await?;

        self.teardown_backend(session).await?;

        let roster = self.sessions.containers(&session.id).await?;
        for row in &roster {
            self.sessions
                .update_container_state(
                    &session.id,
                    &row.name,
                    None,
                    None,
                    ContainerObservedState::Stopped,
                )
                .await?;
        }

        session.observed_state = SessionState::Stopped;
        session.primary_container_id = None;
        session.endpoint = None;
        session.network_id = None;
        session.ready_at = None;
        self.sessions.save(session).await?;
        Ok(())
    }

    pub async fn touch(&self, session_id: &str) -> Result<()> {
        if let Some(mut session) = self.sessions.get(session_id).await? {
            session.last_activity = Utc::now();
            self.sessions.save(&mut session).await?;
        }
        Ok(())
    }

    /// Best-effort destruction of every backend resource the session owns.
    async fn teardown_backend(&self, session: &Session) -> Result<()> {
        let roster = self.sessions.containers(&session.id).await?;
        for row in &roster {
            if let Some(container_id) = &row.container_id {
                self.pool.invalidate_container(container_id);
                if let Err(e) = self.driver.stop_container(container_id).await {
                    warn!(container_id = %container_id, error = %e, "stop failed during teardown");
                }
                if let Err(e) = self.driver.destroy_container(container_id).await {
                    warn!(container_id = %container_id, error = %e, "destroy failed during teardown");
                }
            }
        }
        if let Some(network) = &session.network_id {
            if let Err(e) = self.driver.destroy_network(network).await {
                warn!(network = %network, error = %e, "network destroy failed during teardown");
            }
        }
        Ok(())
    }

    /// Terminal failure: roll back backend resources and record the reason.
    async fn fail_session(&self, session: &mut Session, reason: &str) -> Result<()> {
        warn!(session_id = %session.id, reason = %reason, "session.failed");
        self.teardown_backend(session).await?;
        session.observed_state = SessionState::Failed;
        session.failed_reason = Some(reason.to_string());
        session.primary_container_id = None;
        session.endpoint = None;
        session.network_id = None;
        self.sessions.save(session).await?;
        Ok(())
    }
}
