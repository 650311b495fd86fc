//! API Facade (§4.10, §6): the daemon's sole external surface, served
//! over a local Unix domain socket rather than TCP — a single operator
//! owns the workspace, so there's no multi-tenant network surface to
//! expose.
//!
//! A single `Router<Arc<Runtime>>` wraps every handler in a shared
//! `TraceLayer` + `CorsLayer` stack.

mod error;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::runtime::Runtime;

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/version", get(routes::version))
        .route("/state", get(routes::state_snapshot))
        .route("/tasks", get(routes::list_tasks))
        .route("/agents", get(routes::list_agents))
        .route("/agents/{id}/output", get(routes::agent_output))
        .route("/agents/{id}/kill", post(routes::kill_agent))
        .route("/agents/{id}/respond", post(routes::respond_to_question))
        .route("/questions", get(routes::list_questions))
        .route("/session/start", post(routes::session_start))
        .route("/session/stop", post(routes::session_stop))
        .route("/workflows", get(routes::list_workflows))
        .route("/workflows/{id}", get(routes::get_workflow).delete(routes::cancel_workflow))
        .route("/workflows/{id}/approve-merge", post(routes::approve_merge))
        .route("/workflows/{id}/reject-merge", post(routes::reject_merge))
        .route("/shutdown", post(routes::shutdown))
        .route("/events", get(routes::events_stream))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()))
        .with_state(runtime)
}

/// Bind the Unix socket and serve until `runtime.shutdown` fires (via
/// `POST /shutdown` or a caught signal) or the listener itself fails.
pub async fn serve(runtime: Arc<Runtime>) -> Result<()> {
    let socket_path = runtime.paths.socket_path();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }

    let listener = tokio::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("binding socket {}", socket_path.display()))?;
    tracing::info!("listening on {}", socket_path.display());

    let app = router(runtime.clone());
    let shutdown = async move {
        runtime.shutdown.notified().await;
        tracing::info!("shutdown requested");
    };

    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
    let _ = std::fs::remove_file(&socket_path);
    result.context("serving API")
}
