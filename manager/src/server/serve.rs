//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::BotError;
use crate::server::handlers::{
    build_handler, build_log_handler, build_log_stream_handler, container_logs_handler,
    create_bot_handler, delete_bot_handler, get_bot_handler, health_handler, job_events_handler,
    list_bots_handler, metrics_handler, pull_rebuild_handler, repo_status_handler,
    restart_handler, start_handler, stats_handler, stop_handler, update_env_handler,
    version_handler, webhook_handler,
};
use crate::server::state::ServerState;

/// Routes of the management API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/metrics", get(metrics_handler))
        // Bots
        .route("/bots", get(list_bots_handler).post(create_bot_handler))
        .route("/bots/{id}", get(get_bot_handler).delete(delete_bot_handler))
        .route("/bots/{id}/env", put(update_env_handler))
        // Operations
        .route("/bots/{id}/build", post(build_handler))
        .route("/bots/{id}/start", post(start_handler))
        .route("/bots/{id}/stop", post(stop_handler))
        .route("/bots/{id}/restart", post(restart_handler))
        .route("/bots/{id}/pull-rebuild", post(pull_rebuild_handler))
        .route("/bots/{id}/webhook", post(webhook_handler))
        // Observation
        .route("/bots/{id}/logs", get(container_logs_handler))
        .route("/bots/{id}/stats", get(stats_handler))
        .route("/bots/{id}/build-log", get(build_log_handler))
        .route("/bots/{id}/build-log/stream", get(build_log_stream_handler))
        .route("/bots/{id}/repo", get(repo_status_handler))
        .route("/jobs/events", get(job_events_handler))
        // State and middleware
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), BotError>>, BotError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| BotError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| BotError::ServerError(e.to_string()))
    });

    Ok(handle)
}
