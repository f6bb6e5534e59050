//! Hub HTTP surface (spec §6): `POST /jobs` submission (wired to
//! `JobTracker::start_tracking`), job/correlation-group query,
//! `/state-sync/status` and `/pollers/status` summaries, bulk-ops, plus
//! `GET /health`.

mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;

use crate::jobs::JobTracker;
use crate::state_sync::{StateCache, StateSync};

pub struct AppState {
    pub db: PgPool,
    pub tracker: Arc<JobTracker>,
    pub state_cache: Arc<StateCache>,
    pub state_sync: Arc<StateSync>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/jobs", get(routes::list_jobs_by_status).post(routes::submit_job))
        .route("/jobs/:id", get(routes::get_job))
        .route("/jobs/correlation/:correlation_id", get(routes::get_correlation_group))
        .route("/state-sync/vms", get(routes::list_cached_vms))
        .route("/state-sync/volumes", get(routes::list_cached_volumes))
        .route("/state-sync/status", get(routes::state_sync_status))
        .route("/pollers/status", get(routes::poller_status))
        .route("/bulk-ops", post(routes::apply_bulk_ops))
        .with_state(state)
}
