//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use taskherd_core::config::{GatewayConfig, TaskherdConfig};
use taskherd_scheduler::Engine;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    /// Persistence, queue and task service of this process.
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(config: &TaskherdConfig, engine: Arc<Engine>) -> Self {
        Self {
            gateway_config: config.gateway.clone(),
            start_time: std::time::Instant::now(),
            engine,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/api/v1/health", get(super::routes::system_health))
        .route("/api/v1/commands", get(super::routes::list_commands))
        .route(
            "/api/v1/tasks",
            get(super::routes::list_tasks).post(super::routes::create_task),
        )
        .route("/api/v1/tasks/launch", post(super::routes::bulk_launch))
        .route("/api/v1/tasks/stop", post(super::routes::bulk_stop))
        .route(
            "/api/v1/tasks/{id}",
            get(super::routes::get_task).delete(super::routes::delete_task),
        )
        .route("/api/v1/tasks/{id}/launch", post(super::routes::launch_task))
        .route("/api/v1/tasks/{id}/stop", post(super::routes::stop_task))
        .route("/api/v1/tasks/{id}/reports", get(super::routes::list_reports))
        .route("/api/v1/tasks/{id}/prune", post(super::routes::prune_reports))
        .route(
            "/api/v1/reports/{id}",
            get(super::routes::get_report).delete(super::routes::delete_report),
        )
        .route("/api/v1/reports/{id}/lines", get(super::routes::report_lines))
        .route("/api/v1/reports/{id}/poll", get(super::routes::poll_log))
        .route("/reports/{id}/live", get(super::routes::live_log))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve the API until `shutdown` turns true.
pub async fn start(
    config: &TaskherdConfig,
    engine: Arc<Engine>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let state = AppState::new(config, engine);
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    tracing::info!("🛑 Gateway stopped");
    Ok(())
}
