// ABOUTME: HTTP surface for Bay - REST verbs mapped onto the orchestration core
// ABOUTME: Thin layer: routing, auth, error translation, idempotency replay

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;

pub mod auth;
pub mod error;
pub mod handlers;
pub mod idem;
pub mod state;

pub use auth::{AuthConfig, Owner};
pub use error::{ApiError, ApiResult};
pub use state::AppState;

use handlers::{admin, capabilities, cargos, history, sandboxes, skills};

/// Assemble the versioned router. Authentication wraps everything except the
/// health probe.
pub fn create_router(state: AppState) -> Router {
    let v1 = Router::new()
        // Sandbox lifecycle
        .route(
            "/sandboxes",
            post(sandboxes::create_sandbox).get(sandboxes::list_sandboxes),
        )
        .route(
            "/sandboxes/:id",
            get(sandboxes::get_sandbox).delete(sandboxes::delete_sandbox),
        )
        .route("/sandboxes/:id/keepalive", post(sandboxes::keepalive))
        .route("/sandboxes/:id/stop", post(sandboxes::stop_sandbox))
        .route("/sandboxes/:id/extend_ttl", post(sandboxes::extend_ttl))
        .route("/sandboxes/:id/logs", get(sandboxes::sandbox_logs))
        // Capabilities
        .route("/sandboxes/:id/python/exec", post(capabilities::exec_python))
        .route("/sandboxes/:id/shell/exec", post(capabilities::exec_shell))
        .route("/sandboxes/:id/files/read", post(capabilities::read_file))
        .route("/sandboxes/:id/files/write", post(capabilities::write_file))
        .route("/sandboxes/:id/files/list", post(capabilities::list_files))
        .route("/sandboxes/:id/files/delete", post(capabilities::delete_file))
        .route("/sandboxes/:id/files/upload", post(capabilities::upload_file))
        .route(
            "/sandboxes/:id/files/download",
            post(capabilities::download_file),
        )
        .route("/sandboxes/:id/browser/exec", post(capabilities::exec_browser))
        .route(
            "/sandboxes/:id/browser/exec_batch",
            post(capabilities::exec_browser_batch),
        )
        // Execution history
        .route(
            "/sandboxes/:id/executions/last",
            get(history::last_execution),
        )
        .route("/executions", get(history::list_executions))
        .route(
            "/executions/:id",
            get(history::get_execution).patch(history::annotate_execution),
        )
        // Skill lifecycle
        .route(
            "/skills/candidates",
            post(skills::create_candidate).get(skills::list_candidates),
        )
        .route(
            "/skills/candidates/:id",
            get(skills::get_candidate).delete(skills::delete_candidate),
        )
        .route(
            "/skills/candidates/:id/evaluate",
            post(skills::evaluate_candidate),
        )
        .route(
            "/skills/candidates/:id/promote",
            post(skills::promote_candidate),
        )
        .route("/skills/releases", get(skills::list_releases))
        .route("/skills/releases/:id", delete(skills::delete_release))
        .route(
            "/skills/releases/:id/rollback",
            post(skills::rollback_release),
        )
        .route("/skills/payloads", post(skills::create_payload))
        .route("/skills/payloads/:ref", get(skills::get_payload))
        // Cargos
        .route("/cargos", post(cargos::create_cargo).get(cargos::list_cargos))
        .route(
            "/cargos/:id",
            get(cargos::get_cargo).delete(cargos::delete_cargo),
        )
        // Profiles and admin
        .route("/profiles", get(admin::list_profiles))
        .route("/admin/gc", post(admin::trigger_gc))
        .route("/health", get(admin::health));

    Router::new()
        .nest("/v1", v1)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ))
        .with_state(state)
}
