use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use foadmin_core::config::FoadminConfig;
use foadmin_scheduler::{JobService, Scheduler};
use std::sync::Arc;

/// Shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: FoadminConfig,
    pub scheduler: Scheduler,
    pub jobs: JobService,
}

impl AppState {
    pub fn new(config: FoadminConfig, scheduler: Scheduler) -> Self {
        let jobs = JobService::new(scheduler.bridge().clone());
        Self {
            config,
            scheduler,
            jobs,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::jobs;

    let admin = Router::new()
        .route("/list", get(jobs::list_jobs))
        .route("/create", post(jobs::create_job))
        .route("/update/{id}", put(jobs::update_job))
        .route("/delete/{id}", delete(jobs::delete_job))
        .route("/pause/{id}", post(jobs::pause_job))
        .route("/resume/{id}", post(jobs::resume_job))
        .route("/run/{id}", post(jobs::run_job))
        .route("/logs", get(jobs::list_logs))
        .route("/logs/clear", delete(jobs::clear_logs))
        .route("/{id}", get(jobs::get_job))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_auth,
        ));

    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .nest("/api/admin/system/job", admin)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
