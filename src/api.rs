//! Minimal HTTP liveness surface: `/health`, `/status`, and machine-readable
//! IPC envelope schemas for downstream agent-harness integrators.
//!
//! Grounded on `api/server.rs`'s axum router shape and `api/system.rs`'s
//! `health`/`status` handlers, pared down to the operational surface this
//! crate actually owns — there is no web UI or per-agent REST surface here,
//! just the liveness probe every teacher-pack service carries plus a
//! schema endpoint so agent-harness authors can validate the IPC wire
//! format without vendoring this crate's types.

use crate::orchestrator::Orchestrator;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    pid: u32,
    uptime_seconds: u64,
    registered_groups: usize,
}

/// Bind the liveness/schema router and serve it until `shutdown_rx` fires.
pub async fn start(
    bind: SocketAddr,
    state: Arc<ApiState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> crate::error::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/schema/ipc-task", get(schema_ipc_task))
        .route("/schema/ipc-response", get(schema_ipc_response))
        .route("/schema/agent-input", get(schema_agent_input))
        .route("/schema/agent-output", get(schema_agent_output))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "api server started");

    let handle = tokio::spawn(async move {
        let shutdown_signal = async move {
            let _ = shutdown_rx.wait_for(|shutdown| *shutdown).await;
        };
        if let Err(error) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await {
            tracing::error!(%error, "api server failed");
        }
    });

    Ok(handle)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let registered_groups = state
        .orchestrator
        .get_available_groups()
        .await
        .map(|groups| groups.len())
        .unwrap_or(0);

    Json(StatusResponse {
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        registered_groups,
    })
}

async fn schema_ipc_task() -> impl IntoResponse {
    Json(schemars::schema_for!(crate::ipc::IpcTask))
}

async fn schema_ipc_response() -> impl IntoResponse {
    Json(schemars::schema_for!(crate::ipc::IpcResponse))
}

async fn schema_agent_input() -> impl IntoResponse {
    Json(schemars::schema_for!(crate::backend::AgentInput))
}

async fn schema_agent_output() -> impl IntoResponse {
    Json(schemars::schema_for!(crate::parser::AgentOutput))
}
