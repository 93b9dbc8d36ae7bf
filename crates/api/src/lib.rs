//! HTTP ingestion service.
//!
//! One write endpoint: `POST /links` normalizes the URL, computes the
//! subject id, and appends `link.added`. Read-model rows are the
//! materializer's alone; this service never writes projections.
//! Authentication is layered on by the deployment, not here.

pub mod routes;

use sqlx::PgPool;

use lifestream_infra::PostgresLedger;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub ledger: PostgresLedger,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        let ledger = PostgresLedger::new(pool.clone());
        Self { pool, ledger }
    }
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> axum::Router {
    routes::router(state)
}
