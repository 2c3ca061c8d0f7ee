//! Web layer: thin axum handlers over the job store, the supervisor and
//! the progress tracker. Route wiring only; all control-plane logic
//! lives in the services.

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::database::Database;
use crate::progress::ProgressTracker;
use crate::supervisor::RunSupervisor;

pub mod api;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub supervisor: RunSupervisor,
    pub progress: ProgressTracker,
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(
        config: &Config,
        database: Database,
        supervisor: RunSupervisor,
        progress: ProgressTracker,
    ) -> Result<Self> {
        let app = create_router(AppState {
            database,
            supervisor,
            progress,
        });

        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        Ok(Self { app, addr })
    }

    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app).await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Build the full route tree. Public so integration tests can drive the
/// router without binding a socket.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/jobs", get(api::list_jobs).post(api::create_job))
        .route(
            "/api/jobs/:id",
            get(api::get_job).put(api::update_job).delete(api::delete_job),
        )
        .route("/api/jobs/:id/run", post(api::trigger_job_run))
        .route("/api/runs", get(api::list_runs).post(api::trigger_run))
        .route(
            "/api/runs/:id",
            get(api::get_run).delete(api::delete_run),
        )
        .route("/api/runs/:id/stop", post(api::stop_run))
        .route("/api/runs/:id/resume", post(api::resume_run))
        .route("/api/runs/:id/log", get(api::get_run_log))
        .route("/api/progress", get(api::get_progress))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
