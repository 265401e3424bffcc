//! Admin HTTP surface.
//!
//! Public endpoints (`/health`, `/version`, `/metrics`) sit next to the
//! authenticated `/admin` tree. Admin routes answer with the uniform
//! `{ok, data?, error?}` envelope; the auth gate is a single middleware
//! layer over the whole tree.

mod handlers;
mod middleware;
mod response;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, put};
use axum::Router;

use payram_agent_core::config::AgentConfig;
use payram_agent_core::secrets::SecretStore;
use payram_agent_core::status::StatusStore;
use payram_agent_core::supervisor::{RestartChildren, Supervisor, SupervisorStatus};
use payram_agent_core::update::UpdateController;

use crate::metrics::AgentMetrics;

pub use middleware::{parse_allowlist, AdminGuard, Cidr};
pub use response::{respond_error, respond_ok, ErrorBody};

/// What the admin surface needs from the supervisor: restarts plus
/// read-only status and log access.
pub trait ChildSupervisor: RestartChildren {
    /// Snapshot of both children.
    fn status(&self) -> SupervisorStatus;

    /// The last `tail` lines for a child; `None` for unknown names.
    fn logs(&self, component: &str, tail: usize) -> Option<Vec<String>>;
}

impl ChildSupervisor for Supervisor {
    fn status(&self) -> SupervisorStatus {
        Supervisor::status(self)
    }

    fn logs(&self, component: &str, tail: usize) -> Option<Vec<String>> {
        Supervisor::logs(self, component, tail)
    }
}

/// Shared state for every admin handler.
#[derive(Clone)]
pub struct AppState {
    /// Agent configuration.
    pub config: Arc<AgentConfig>,
    /// Supervisor capability for status, logs, and restarts.
    pub supervisor: Arc<dyn ChildSupervisor>,
    /// The update controller.
    pub controller: Arc<UpdateController>,
    /// Status document store for `/admin/update/status`.
    pub status: StatusStore,
    /// Secret store for the `/admin/secrets` routes.
    pub secrets: SecretStore,
    /// Agent metrics registry.
    pub metrics: Arc<AgentMetrics>,
    /// The auth gate.
    pub guard: Arc<AdminGuard>,
    /// Client for best-effort child version fetches.
    pub http: reqwest::Client,
}

/// Builds the full admin router over `state`.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/version", get(handlers::admin_version))
        .route("/update/available", get(handlers::update_available))
        .route("/update/apply", post(handlers::update_apply))
        .route("/update/rollback", post(handlers::update_rollback))
        .route("/update/status", get(handlers::update_status))
        .route("/child/status", get(handlers::child_status))
        .route("/child/restart", post(handlers::child_restart))
        .route("/logs", get(handlers::logs))
        .route(
            "/secrets/openai",
            put(handlers::put_secret).delete(handlers::delete_secret),
        )
        .route("/secrets/status", get(handlers::secrets_status))
        .layer(from_fn_with_state(state.clone(), middleware::require_admin));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/version", get(handlers::version))
        .route("/metrics", get(handlers::metrics))
        .nest("/admin", admin)
        .with_state(state)
}
