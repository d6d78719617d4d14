// ABOUTME: Bay server binary - wires driver, storage, core services and HTTP surface
// ABOUTME: Spawns the GC loops and serves /v1 until shutdown

use axum::http::{HeaderValue, Method};
use bay_api::{AppState, AuthConfig};
use bay_core::{
    CapabilityRouter, CargoManager, ExecutionHistory, Gc, GcConfig, IdempotencyService, LockTable,
    ProfileRegistry, SandboxManager, SessionConfig, SessionManager, SkillLifecycle,
};
use bay_driver::docker::DockerDriverConfig;
use bay_driver::scheduler::SchedulerDriverConfig;
use bay_driver::{DockerDriver, Driver, SchedulerDriver};
use bay_runtime::AdapterPool;
use bay_storage::{
    CargoStore, ExecutionStore, GcLeaseStore, IdempotencyStore, SandboxStore, SessionStore,
    SkillStore,
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::{Config, DriverKind};

#[derive(Parser, Debug)]
#[command(name = "bay-server", about = "Bay sandbox orchestration service")]
struct Args {
    /// Listen host; overrides BAY_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Listen port; overrides BAY_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Database URL; overrides BAY_DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }

    info!(
        host = %config.host,
        port = config.port,
        driver = ?config.driver,
        dev_mode = config.dev_mode,
        "starting bay server"
    );

    let pool = bay_storage::connect(&config.database_url).await?;

    let driver: Arc<dyn Driver> = match config.driver {
        DriverKind::Docker => Arc::new(DockerDriver::new(DockerDriverConfig {
            default_network: config.docker_network.clone(),
        })?),
        DriverKind::Scheduler => Arc::new(SchedulerDriver::new(SchedulerDriverConfig {
            base_url: config.scheduler_url.clone(),
            namespace: config.scheduler_namespace.clone(),
            ..Default::default()
        })?),
    };

    let adapters = Arc::new(AdapterPool::new());
    let profiles = Arc::new(ProfileRegistry::new()?);
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
        SessionConfig::default(),
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
    let capability_router = Arc::new(CapabilityRouter::new(
        sandbox_mgr.clone(),
        session_mgr.clone(),
        profiles.clone(),
        adapters.clone(),
        history.clone(),
    ));
    let skills = Arc::new(SkillLifecycle::new(
        SkillStore::new(pool.clone()),
        ExecutionStore::new(pool.clone()),
    ));
    let idempotency = Arc::new(IdempotencyService::new(IdempotencyStore::new(pool.clone())));

    let gc = Arc::new(Gc::new(
        driver.clone(),
        sandbox_mgr.clone(),
        SandboxStore::new(pool.clone()),
        SessionStore::new(pool.clone()),
        CargoStore::new(pool.clone()),
        IdempotencyStore::new(pool.clone()),
        GcLeaseStore::new(pool.clone()),
        locks.clone(),
        GcConfig::default(),
    ));
    let gc_handles = gc.clone().spawn();
    info!(tasks = gc_handles.len(), "gc loops running");

    let state = AppState {
        sandbox_mgr,
        cargo_mgr,
        router: capability_router,
        history,
        skills,
        idempotency,
        gc,
        profiles,
        auth: Arc::new(AuthConfig {
            tokens: config.auth_tokens.clone(),
            dev_mode: config.dev_mode,
        }),
    };

    let mut app = bay_api::create_router(state);
    if let Some(origin) = &config.cors_origin {
        let cors = CorsLayer::new()
            .allow_origin(origin.parse::<HeaderValue>()?)
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
            .allow_headers(Any);
        app = app.layer(cors);
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "bay server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
