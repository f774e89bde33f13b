//! Prometheus metrics: global registry plus an HTTP server exposing
//! `/metrics`. Compiled only under the `metrics` feature, mirroring the
//! teacher's `telemetry/registry.rs` and `telemetry/server.rs` split.

use prometheus::{Encoder as _, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::net::SocketAddr;
use std::sync::LazyLock;

static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Global metrics instance. Handles are cheap to clone (`Arc` internally),
/// so call sites grab references via [`Metrics::global`] rather than
/// threading state through every function signature.
pub struct Metrics {
    registry: Registry,

    /// Total agent sessions started, labeled by backend name.
    pub sessions_started_total: IntCounterVec,
    /// Total agent sessions that ended in error, labeled by backend name.
    pub sessions_failed_total: IntCounterVec,
    /// Total IPC tasks dispatched, labeled by task type.
    pub ipc_tasks_total: IntCounterVec,
    /// Total IPC tasks a handler rejected, labeled by task type.
    pub ipc_tasks_rejected_total: IntCounterVec,
    /// Per-chat queue depth right now (pending + active), labeled by backend.
    pub queue_depth: IntGaugeVec,
    /// Outbound channel sends that failed, labeled by channel name.
    pub channel_send_errors_total: IntCounterVec,
    /// Total channel reconnect attempts, labeled by channel name.
    pub channel_reconnects_total: IntCounterVec,
    /// Agent session wall-clock duration in seconds.
    pub session_duration_seconds: Histogram,
    /// Total scheduled tasks dispatched.
    pub scheduled_tasks_dispatched_total: IntCounter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let sessions_started_total = IntCounterVec::new(
            Opts::new("nanoclaw_sessions_started_total", "Total agent sessions started"),
            &["backend"],
        )
        .expect("hardcoded metric descriptor");
        let sessions_failed_total = IntCounterVec::new(
            Opts::new("nanoclaw_sessions_failed_total", "Total agent sessions that ended in error"),
            &["backend"],
        )
        .expect("hardcoded metric descriptor");
        let ipc_tasks_total = IntCounterVec::new(
            Opts::new("nanoclaw_ipc_tasks_total", "Total IPC tasks dispatched"),
            &["task_type"],
        )
        .expect("hardcoded metric descriptor");
        let ipc_tasks_rejected_total = IntCounterVec::new(
            Opts::new("nanoclaw_ipc_tasks_rejected_total", "Total IPC tasks rejected by a handler"),
            &["task_type"],
        )
        .expect("hardcoded metric descriptor");
        let queue_depth = IntGaugeVec::new(
            Opts::new("nanoclaw_queue_depth", "Per-chat queue depth (pending + active)"),
            &["backend"],
        )
        .expect("hardcoded metric descriptor");
        let channel_send_errors_total = IntCounterVec::new(
            Opts::new("nanoclaw_channel_send_errors_total", "Outbound sends that failed"),
            &["channel"],
        )
        .expect("hardcoded metric descriptor");
        let channel_reconnects_total = IntCounterVec::new(
            Opts::new("nanoclaw_channel_reconnects_total", "Total channel reconnect attempts"),
            &["channel"],
        )
        .expect("hardcoded metric descriptor");
        let session_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("nanoclaw_session_duration_seconds", "Agent session wall-clock duration")
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )
        .expect("hardcoded metric descriptor");
        let scheduled_tasks_dispatched_total = IntCounter::new(
            "nanoclaw_scheduled_tasks_dispatched_total",
            "Total scheduled tasks dispatched to the group queue",
        )
        .expect("hardcoded metric descriptor");

        registry.register(Box::new(sessions_started_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(sessions_failed_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(ipc_tasks_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(ipc_tasks_rejected_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(queue_depth.clone())).expect("hardcoded metric");
        registry.register(Box::new(channel_send_errors_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(channel_reconnects_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(session_duration_seconds.clone())).expect("hardcoded metric");
        registry.register(Box::new(scheduled_tasks_dispatched_total.clone())).expect("hardcoded metric");

        Self {
            registry,
            sessions_started_total,
            sessions_failed_total,
            ipc_tasks_total,
            ipc_tasks_rejected_total,
            queue_depth,
            channel_send_errors_total,
            channel_reconnects_total,
            session_duration_seconds,
            scheduled_tasks_dispatched_total,
        }
    }

    pub fn global() -> &'static Self {
        &METRICS
    }
}

/// Spawn the `/metrics` HTTP server as a background task. Shuts down when
/// `shutdown_rx` signals true.
pub async fn start_metrics_server(
    bind: SocketAddr,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|error| anyhow::anyhow!("failed to bind metrics server to {bind}: {error}"))?;
    tracing::info!(address = %bind, "metrics server started");

    let handle = tokio::spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        let shutdown_signal = async move {
            let _ = shutdown_rx.wait_for(|shutdown| *shutdown).await;
        };
        if let Err(error) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await {
            tracing::error!(%error, "metrics server failed");
        }
    });

    async fn metrics_handler() -> impl IntoResponse {
        let metrics = Metrics::global();
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        match encoder.encode(&metrics.registry.gather(), &mut buffer) {
            Ok(()) => match String::from_utf8(buffer) {
                Ok(text) => (
                    StatusCode::OK,
                    [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                    text,
                )
                    .into_response(),
                Err(error) => {
                    tracing::warn!(%error, "metrics encoding produced invalid UTF-8");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            },
            Err(error) => {
                tracing::warn!(%error, "failed to encode metrics");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    Ok(handle)
}
