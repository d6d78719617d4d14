// ABOUTME: Garbage collector - idle sessions, expired sandboxes, orphan cargos/containers
// ABOUTME: Each task runs on its own interval, guarded by a storage lease

use crate::error::Result;
use crate::locks::LockTable;
use crate::sandbox::SandboxManager;
use bay_driver::{Driver, LABEL_MANAGED, LABEL_SANDBOX_ID, LABEL_SESSION_ID};
use bay_storage::{CargoStore, GcLeaseStore, IdempotencyStore, SandboxStore, SessionState, SessionStore};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Per-sweep batch ceiling; the next interval picks up the rest.
const BATCH_LIMIT: i64 = 100;

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Identifies this instance in lease rows.
    pub instance_id: String,
    pub idle_session_interval: Duration,
    pub expired_sandbox_interval: Duration,
    pub orphan_cargo_interval: Duration,
    pub orphan_container_interval: Duration,
    pub lease_ttl_seconds: i64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("bay-{}", uuid::Uuid::new_v4().simple()),
            idle_session_interval: Duration::from_secs(60),
            expired_sandbox_interval: Duration::from_secs(60),
            orphan_cargo_interval: Duration::from_secs(300),
            orphan_container_interval: Duration::from_secs(300),
            lease_ttl_seconds: 120,
        }
    }
}

/// Counts from one full sweep, for the admin trigger response.
#[derive(Debug, Default, Serialize)]
pub struct GcReport {
    pub idle_sessions_stopped: u64,
    pub sandboxes_expired: u64,
    pub cargos_reaped: u64,
    pub containers_reaped: u64,
    pub idempotency_purged: u64,
}

pub struct Gc {
    driver: Arc<dyn Driver>,
    sandbox_mgr: Arc<SandboxManager>,
    sandboxes: SandboxStore,
    sessions: SessionStore,
    cargos: CargoStore,
    idempotency: IdempotencyStore,
    leases: GcLeaseStore,
    locks: Arc<LockTable>,
    config: GcConfig,
}

impl Gc {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Arc<dyn Driver>,
        sandbox_mgr: Arc<SandboxManager>,
        sandboxes: SandboxStore,
        sessions: SessionStore,
        cargos: CargoStore,
        idempotency: IdempotencyStore,
        leases: GcLeaseStore,
        locks: Arc<LockTable>,
        config: GcConfig,
    ) -> Self {
        Self {
            driver,
            sandbox_mgr,
            sandboxes,
            sessions,
            cargos,
            idempotency,
            leases,
            locks,
            config,
        }
    }

    /// Stop sessions idle past their timeout. The idle check is repeated
    /// inside the sandbox lock, so a keepalive racing the scan wins.
    pub async fn run_idle_sessions(&self) -> Result<u64> {
        let now = Utc::now();
        let mut stopped = 0;

        let candidates = self
            .sessions
            .list_by_observed_states(&[SessionState::Running, SessionState::Degraded])
            .await?;

        for session in candidates {
            if session.idle_deadline() > now {
                continue;
            }
            match self.sandbox_mgr.stop_if_idle(&session.sandbox_id, now).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    sandbox_id = %session.sandbox_id,
                    error = %e,
                    "idle-session reap failed"
                ),
            }
        }

        if stopped > 0 {
            info!(stopped, "gc.idle_sessions");
        }
        Ok(stopped)
    }

    /// Delete sandboxes whose expires-at has passed, cascading managed cargo.
    pub async fn run_expired_sandboxes(&self) -> Result<u64> {
        let now = Utc::now();
        let mut deleted = 0;

        for sandbox in self.sandboxes.list_expired(now, BATCH_LIMIT).await? {
            match self.sandbox_mgr.delete(&sandbox.id, &sandbox.owner).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(
                    sandbox_id = %sandbox.id,
                    error = %e,
                    "expired-sandbox reap failed"
                ),
            }
        }

        if deleted > 0 {
            info!(deleted, "gc.expired_sandboxes");
        }
        Ok(deleted)
    }

    /// Destroy volumes of managed cargos whose owning sandbox is gone.
    /// Recovers from crashes between sandbox delete and cargo cascade.
    pub async fn run_orphan_cargos(&self) -> Result<u64> {
        let mut reaped = 0;

        for cargo in self.cargos.list_orphan_managed(BATCH_LIMIT).await? {
            if let Err(e) = self.driver.destroy_volume(&cargo.backend_handle).await {
                warn!(cargo_id = %cargo.id, error = %e, "orphan cargo volume destroy failed");
                continue;
            }
            if let Err(e) = self.cargos.remove(&cargo.id).await {
                warn!(cargo_id = %cargo.id, error = %e, "orphan cargo record removal failed");
                continue;
            }
            reaped += 1;
        }

        if reaped > 0 {
            info!(reaped, "gc.orphan_cargos");
        }
        Ok(reaped)
    }

    /// Destroy backend containers whose session no longer lives. Recovers
    /// from crashes mid-orchestration. The liveness check is re-read under
    /// the sandbox lock before destruction.
    pub async fn run_orphan_containers(&self) -> Result<u64> {
        let mut reaped = 0;
        let labeled = self.driver.list_labeled(LABEL_MANAGED, "true").await?;
        let live = self.sessions.live_session_ids().await?;

        for container in labeled {
            let session_id = container.labels.get(LABEL_SESSION_ID);
            if session_id.map(|id| live.contains(id)).unwrap_or(false) {
                continue;
            }

            // Serialize with request handlers that may be mid-converge.
            let reaped_this = match container.labels.get(LABEL_SANDBOX_ID) {
                Some(sandbox_id) => {
                    let lock = self.locks.acquire(sandbox_id);
                    let _guard = lock.lock().await;
                    let live = self.sessions.live_session_ids().await?;
                    let still_orphan = container
                        .labels
                        .get(LABEL_SESSION_ID)
                        .map(|id| !live.contains(id))
                        .unwrap_or(true);
                    if still_orphan {
                        self.driver.destroy_container(&container.container_id).await?;
                        true
                    } else {
                        false
                    }
                }
                None => {
                    self.driver.destroy_container(&container.container_id).await?;
                    true
                }
            };
            if reaped_this {
                reaped += 1;
            }
        }

        if reaped > 0 {
            info!(reaped, "gc.orphan_containers");
        }
        Ok(reaped)
    }

    pub async fn purge_idempotency(&self) -> Result<u64> {
        Ok(self.idempotency.delete_expired(Utc::now()).await?)
    }

    /// Run every task once; used by the admin trigger.
    pub async fn sweep(&self) -> GcReport {
        let mut report = GcReport::default();
        match self.run_idle_sessions().await {
            Ok(n) => report.idle_sessions_stopped = n,
            Err(e) => warn!(error = %e, "gc sweep: idle sessions failed"),
        }
        match self.run_expired_sandboxes().await {
            Ok(n) => report.sandboxes_expired = n,
            Err(e) => warn!(error = %e, "gc sweep: expired sandboxes failed"),
        }
        match self.run_orphan_cargos().await {
            Ok(n) => report.cargos_reaped = n,
            Err(e) => warn!(error = %e, "gc sweep: orphan cargos failed"),
        }
        match self.run_orphan_containers().await {
            Ok(n) => report.containers_reaped = n,
            Err(e) => warn!(error = %e, "gc sweep: orphan containers failed"),
        }
        match self.purge_idempotency().await {
            Ok(n) => report.idempotency_purged = n,
            Err(e) => warn!(error = %e, "gc sweep: idempotency purge failed"),
        }
        report
    }

    /// Spawn one background loop per task, each lease-guarded so only one
    /// instance in a cluster runs it at a time.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let tasks: [(&'static str, Duration, TaskFn); 4] = [
            (
                "idle_sessions",
                self.config.idle_session_interval,
                |gc| Box::pin(async move { gc.run_idle_sessions().await.map(|_| ()) }),
            ),
            (
                "expired_sandboxes",
                self.config.expired_sandbox_interval,
                |gc| Box::pin(async move { gc.run_expired_sandboxes().await.map(|_| ()) }),
            ),
            (
                "orphan_cargos",
                self.config.orphan_cargo_interval,
                |gc| Box::pin(async move { gc.run_orphan_cargos().await.map(|_| ()) }),
            ),
            (
                "orphan_containers",
                self.config.orphan_container_interval,
                |gc| Box::pin(async move { gc.run_orphan_containers().await.map(|_| ()) }),
            ),
        ];

        tasks
            .into_iter()
            .map(|(name, interval, run)| {
                let gc = self.clone();
                tokio::spawn(async move {
                    info!(task = name, interval_secs = interval.as_secs(), "gc.task.start");
                    loop {
                        tokio::time::sleep(interval).await;

                        let lease = gc
                            .leases
                            .try_acquire(
                                name,
                                &gc.config.instance_id,
                                chrono::Duration::seconds(gc.config.lease_ttl_seconds),
                                Utc::now(),
                            )
                            .await;
                        match lease {
                            Ok(true) => {
                                if let Err(e) = run(gc.clone()).await {
                                    warn!(task = name, error = %e, "gc task run failed");
                                }
                            }
                            Ok(false) => {}
                            Err(e) => warn!(task = name, error = %e, "gc lease acquire failed"),
                        }
                    }
                })
            })
            .collect()
    }
}

type TaskFn = fn(
    Arc<Gc>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;
