// ABOUTME: Shared test harness - scripted backend world with mock driver and adapters
// ABOUTME: Containers, volumes, networks and workspace files live in one in-memory state

use async_trait::async_trait;
use bay_core::{
    CapabilityRouter, CargoManager, ExecutionHistory, LockTable, ProfileRegistry, SandboxManager,
    SessionConfig, SessionManager,
};
use bay_driver::{
    ContainerState, Driver, DriverError, LabeledContainer, LaunchSpec, VolumeSpec,
};
use bay_runtime::{
    AdapterPool, BrowserBatchOutcome, BrowserStep, ExecOutcome, FileEntry, RuntimeAdapter,
    RuntimeError, RuntimeKind, RuntimeMeta,
};
use bay_storage::{
    CargoStore, ExecutionStore, GcLeaseStore, IdempotencyStore, SandboxStore, SessionStore,
};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct MockContainer {
    pub name: String,
    pub running: bool,
    pub volume: String,
    pub labels: HashMap<String, String>,
}

/// The scripted backend: everything the driver and runtimes would touch.
#[derive(Default)]
pub struct WorldState {
    pub containers: HashMap<String, MockContainer>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    /// Files keyed by (volume handle, path): volume state survives sessions.
    pub files: HashMap<(String, String), Vec<u8>>,
    pub container_seq: u64,
    pub create_calls: u64,
    /// Fail the Nth create_container call (1-based).
    pub fail_create_at: Option<u64>,
    /// Fail start_container for specs whose name contains this marker.
    pub fail_start_marker: Option<String>,
    /// Remaining meta probes that fail per endpoint (simulates slow boot).
    pub meta_failures_left: HashMap<String, u32>,
}

#[derive(Default)]
pub struct World {
    pub state: Mutex<WorldState>,
}

impl World {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().unwrap().networks.len()
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().unwrap().volumes.len()
    }

    pub fn create_calls(&self) -> u64 {
        self.state.lock().unwrap().create_calls
    }

    /// Simulate an external kill: the container vanishes from the backend.
    pub fn kill_container(&self, container_id: &str) {
        self.state.lock().unwrap().containers.remove(container_id);
    }

    pub fn running_container_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn volume_of_endpoint(&self, endpoint: &str) -> Option<String> {
        let container_id = endpoint.strip_prefix("mock://")?;
        let state = self.state.lock().unwrap();
        state.containers.get(container_id).map(|c| c.volume.clone())
    }
}

pub struct MockDriver {
    pub world: Arc<World>,
}

#[async_trait]
impl Driver for MockDriver {
    async fn create_volume(&self, spec: &VolumeSpec) -> bay_driver::Result<String> {
        let mut state = self.world.state.lock().unwrap();
        state.volumes.push(spec.name.clone());
        Ok(spec.name.clone())
    }

    async fn destroy_volume(&self, handle: &str) -> bay_driver::Result<()> {
        let mut state = self.world.state.lock().unwrap();
        state.volumes.retain(|v| v != handle);
        Ok(())
    }

    async fn create_network(&self, session_id: &str) -> bay_driver::Result<String> {
        let name = format!("bay-net-{session_id}");
        let mut state = self.world.state.lock().unwrap();
        if !state.networks.contains(&name) {
            state.networks.push(name.clone());
        }
        Ok(name)
    }

    async fn destroy_network(&self, handle: &str) -> bay_driver::Result<()> {
        let mut state = self.world.state.lock().unwrap();
        state.networks.retain(|n| n != handle);
        Ok(())
    }

    async fn create_container(&self, spec: &LaunchSpec) -> bay_driver::Result<String> {
        let mut state = self.world.state.lock().unwrap();
        state.create_calls += 1;
        if state.fail_create_at == Some(state.create_calls) {
            return Err(DriverError::Backend("scripted create failure".into()));
        }
        state.container_seq += 1;
        let id = format!("ctr-{}", state.container_seq);
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                running: false,
                volume: spec.volume.handle.clone(),
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> bay_driver::Result<String> {
        let mut state = self.world.state.lock().unwrap();
        let marker = state.fail_start_marker.clone();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
        if let Some(marker) = marker {
            if container.name.contains(&marker) {
                return Err(DriverError::Backend("scripted start failure".into()));
            }
        }
        container.running = true;
        Ok(format!("mock://{container_id}"))
    }

    async fn stop_container(&self, container_id: &str) -> bay_driver::Result<()> {
        let mut state = self.world.state.lock().unwrap();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.running = false;
        }
        Ok(())
    }

    async fn destroy_container(&self, container_id: &str) -> bay_driver::Result<()> {
        let mut state = self.world.state.lock().unwrap();
        state.containers.remove(container_id);
        Ok(())
    }

    async fn status(&self, container_id: &str) -> bay_driver::Result<ContainerState> {
        let state = self.world.state.lock().unwrap();
        Ok(match state.containers.get(container_id) {
            Some(c) if c.running => ContainerState::Running,
            Some(_) => ContainerState::Exited,
            None => ContainerState::NotFound,
        })
    }

    async fn logs(&self, _container_id: &str, _tail: usize) -> bay_driver::Result<String> {
        Ok("mock logs".to_string())
    }

    async fn list_labeled(
        &self,
        label: &str,
        value: &str,
    ) -> bay_driver::Result<Vec<LabeledContainer>> {
        let state = self.world.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(label).map(String::as_str) == Some(value))
            .map(|(id, c)| LabeledContainer {
                container_id: id.clone(),
                labels: c.labels.clone(),
                state: if c.running {
                    ContainerState::Running
                } else {
                    ContainerState::Exited
                },
            })
            .collect())
    }
}

/// Adapter whose behavior is scripted through the shared world.
pub struct MockAdapter {
    pub world: Arc<World>,
    pub endpoint: String,
    pub kind: RuntimeKind,
}

impl MockAdapter {
    fn reachable(&self) -> bay_runtime::Result<()> {
        // A probe against a gone or stopped container cannot connect.
        match self.world.volume_of_endpoint(&self.endpoint) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::Unreachable(self.endpoint.clone())),
        }
    }

    fn volume(&self) -> bay_runtime::Result<String> {
        self.world
            .volume_of_endpoint(&self.endpoint)
            .ok_or_else(|| RuntimeError::Unreachable(self.endpoint.clone()))
    }
}

#[async_trait]
impl RuntimeAdapter for MockAdapter {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn meta(&self) -> bay_runtime::Result<RuntimeMeta> {
        self.reachable()?;
        {
            let mut state = self.world.state.lock().unwrap();
            if let Some(left) = state.meta_failures_left.get_mut(&self.endpoint) {
                if *left > 0 {
                    *left -= 1;
                    return Err(RuntimeError::Unreachable("still booting".into()));
                }
            }
        }
        Ok(RuntimeMeta {
            name: self.kind.as_str().to_string(),
            version: "0.3.0".to_string(),
            api_version: "v1".to_string(),
            mount_path: "/workspace".to_string(),
            capabilities: vec![
                "python".to_string(),
                "shell".to_string(),
                "filesystem".to_string(),
                "browser".to_string(),
            ],
        })
    }

    async fn exec_python(&self, code: &str, _timeout: u64) -> bay_runtime::Result<ExecOutcome> {
        self.reachable()?;
        let output = if code.contains("2*21") {
            "42".to_string()
        } else {
            format!("ok: {code}")
        };
        Ok(ExecOutcome {
            success: true,
            output,
            error: None,
            exit_code: None,
        })
    }

    async fn exec_shell(
        &self,
        command: &str,
        _timeout: u64,
        _cwd: Option<&str>,
    ) -> bay_runtime::Result<ExecOutcome> {
        self.reachable()?;
        // `cat <path>` reads from the workspace volume like the runtime would.
        if let Some(path) = command.strip_prefix("cat ") {
            let volume = self.volume()?;
            let state = self.world.state.lock().unwrap();
            return match state.files.get(&(volume, path.trim().to_string())) {
                Some(bytes) => Ok(ExecOutcome {
                    success: true,
                    output: String::from_utf8_lossy(bytes).to_string(),
                    error: None,
                    exit_code: Some(0),
                }),
                None => Ok(ExecOutcome {
                    success: false,
                    output: String::new(),
                    error: Some(format!("cat: {path}: No such file or directory")),
                    exit_code: Some(1),
                }),
            };
        }
        Ok(ExecOutcome {
            success: true,
            output: format!("ran: {command}"),
            error: None,
            exit_code: Some(0),
        })
    }

    async fn read_file(&self, path: &str) -> bay_runtime::Result<String> {
        let volume = self.volume()?;
        let state = self.world.state.lock().unwrap();
        state
            .files
            .get(&(volume, path.to_string()))
            .map(|b| String::from_utf8_lossy(b).to_string())
            .ok_or_else(|| RuntimeError::FileNotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &str) -> bay_runtime::Result<()> {
        let volume = self.volume()?;
        let mut state = self.world.state.lock().unwrap();
        state
            .files
            .insert((volume, path.to_string()), content.as_bytes().to_vec());
        Ok(())
    }

    async fn list_files(&self, _path: &str) -> bay_runtime::Result<Vec<FileEntry>> {
        let volume = self.volume()?;
        let state = self.world.state.lock().unwrap();
        Ok(state
            .files
            .keys()
            .filter(|(v, _)| *v == volume)
            .map(|(_, p)| FileEntry {
                name: p.clone(),
                path: p.clone(),
                is_dir: false,
                size: 0,
            })
            .collect())
    }

    async fn delete_file(&self, path: &str) -> bay_runtime::Result<()> {
        let volume = self.volume()?;
        let mut state = self.world.state.lock().unwrap();
        state.files.remove(&(volume, path.to_string()));
        Ok(())
    }

    async fn upload_file(&self, path: &str, bytes: &[u8]) -> bay_runtime::Result<()> {
        let volume = self.volume()?;
        let mut state = self.world.state.lock().unwrap();
        state.files.insert((volume, path.to_string()), bytes.to_vec());
        Ok(())
    }

    async fn download_file(&self, path: &str) -> bay_runtime::Result<Vec<u8>> {
        let volume = self.volume()?;
        let state = self.world.state.lock().unwrap();
        state
            .files
            .get(&(volume, path.to_string()))
            .cloned()
            .ok_or_else(|| RuntimeError::FileNotFound(path.to_string()))
    }

    async fn exec_browser(&self, command: &str, _timeout: u64) -> bay_runtime::Result<BrowserStep> {
        self.reachable()?;
        Ok(run_browser_command(command))
    }

    async fn exec_browser_batch(
        &self,
        commands: &[String],
        _timeout: u64,
        stop_on_error: bool,
    ) -> bay_runtime::Result<BrowserBatchOutcome> {
        self.reachable()?;
        let mut steps = Vec::new();
        let mut success = true;
        for command in commands {
            let step = run_browser_command(command);
            let failed = !step.success;
            steps.push(step);
            if failed {
                success = false;
                if stop_on_error {
                    break;
                }
            }
        }
        Ok(BrowserBatchOutcome { success, steps })
    }
}

fn run_browser_command(command: &str) -> BrowserStep {
    let failed = command.starts_with("bad-");
    BrowserStep {
        command: command.to_string(),
        success: !failed,
        output: if failed {
            String::new()
        } else {
            format!("done: {command}")
        },
        error: failed.then(|| format!("unknown subcommand: {command}")),
        duration_ms: 3,
    }
}

/// Everything a test needs, wired the way the server wires production.
pub struct Harness {
    pub world: Arc<World>,
    pub pool: SqlitePool,
    pub adapters: Arc<AdapterPool>,
    pub profiles: Arc<ProfileRegistry>,
    pub locks: Arc<LockTable>,
    pub cargo_mgr: Arc<CargoManager>,
    pub session_mgr: Arc<SessionManager>,
    pub sandbox_mgr: Arc<SandboxManager>,
    pub history: Arc<ExecutionHistory>,
    pub router: Arc<CapabilityRouter>,
    pub driver: Arc<dyn Driver>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_session_config(SessionConfig {
            readiness_deadline: Duration::from_millis(500),
            readiness_initial_backoff: Duration::from_millis(5),
            readiness_max_backoff: Duration::from_millis(20),
        })
        .await
    }

    pub async fn with_session_config(session_config: SessionConfig) -> Self {
        let world = World::new();
        let pool = bay_storage::connect_in_memory().await.unwrap();

        let driver: Arc<dyn Driver> = Arc::new(MockDriver {
            world: world.clone(),
        });

        let adapter_world = world.clone();
        let adapters = Arc::new(AdapterPool::with_factory(Box::new(
            move |_container_id, endpoint, kind| {
                Arc::new(MockAdapter {
                    world: adapter_world.clone(),
                    endpoint: endpoint.to_string(),
                    kind,
                }) as Arc<dyn RuntimeAdapter>
            },
        )));

        let profiles = Arc::new(ProfileRegistry::new().unwrap());
        let locks = Arc::new(LockTable::new());

        let cargo_mgr = Arc::new(CargoManager::new(
            driver.clone(),
            CargoStore::new(pool.clone()),
            SandboxStore::new(pool.clone()),
        ));
        let session_mgr = Arc::new(SessionManager::new(
            driver.clone(),
            SessionStore::new(pool.clone()),
            adapters.clone(),
            session_config,
        ));
        let sandbox_mgr = Arc::new(SandboxManager::new(
            driver.clone(),
            profiles.clone(),
            SandboxStore::new(pool.clone()),
            SessionStore::new(pool.clone()),
            cargo_mgr.clone(),
            session_mgr.clone(),
            locks.clone(),
        ));
        let history = Arc::new(ExecutionHistory::new(ExecutionStore::new(pool.clone())));
        let router = Arc::new(CapabilityRouter::new(
            sandbox_mgr.clone(),
            session_mgr.clone(),
            profiles.clone(),
            adapters.clone(),
            history.clone(),
        ));

        Self {
            world,
            pool,
            adapters,
            profiles,
            locks,
            cargo_mgr,
            session_mgr,
            sandbox_mgr,
            history,
            router,
            driver,
        }
    }

    pub fn sandbox_store(&self) -> SandboxStore {
        SandboxStore::new(self.pool.clone())
    }

    pub fn session_store(&self) -> SessionStore {
        SessionStore::new(self.pool.clone())
    }

    pub fn cargo_store(&self) -> CargoStore {
        CargoStore::new(self.pool.clone())
    }

    pub fn execution_store(&self) -> ExecutionStore {
        ExecutionStore::new(self.pool.clone())
    }

    pub fn idempotency_store(&self) -> IdempotencyStore {
        IdempotencyStore::new(self.pool.clone())
    }

    pub fn lease_store(&self) -> GcLeaseStore {
        GcLeaseStore::new(self.pool.clone())
    }

    pub fn gc(&self) -> bay_core::Gc {
        bay_core::Gc::new(
            self.driver.clone(),
            self.sandbox_mgr.clone(),
            self.sandbox_store(),
            self.session_store(),
            self.cargo_store(),
            self.idempotency_store(),
            self.lease_store(),
            self.locks.clone(),
            bay_core::GcConfig::default(),
        )
    }
}
