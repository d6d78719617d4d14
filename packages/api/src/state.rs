// ABOUTME: Shared application state handed to every handler
// ABOUTME: Thin bundle of Arc'd core services

use crate::auth::AuthConfig;
use bay_core::{
    CapabilityRouter, CargoManager, ExecutionHistory, Gc, IdempotencyService, ProfileRegistry,
    SandboxManager, SkillLifecycle,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub sandbox_mgr: Arc<SandboxManager>,
    pub cargo_mgr: Arc<CargoManager>,
    pub router: Arc<CapabilityRouter>,
    pub history: Arc<ExecutionHistory>,
    pub skills: Arc<SkillLifecycle>,
    pub idempotency: Arc<IdempotencyService>,
    pub gc: Arc<Gc>,
    pub profiles: Arc<ProfileRegistry>,
    pub auth: Arc<AuthConfig>,
}
