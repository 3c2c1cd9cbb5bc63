//! Snapshot Service
//!
//! Long-running worker that keeps experiment, rollout and dashboard
//! snapshots fresh and runs the organization maintenance jobs.
//!
//! # Service Topology
//!
//! - Scheduler worker pool polling the job queue
//! - `/health` - liveness probe
//! - `/ready` - readiness probe (store reachable, gateway answering)
//!
//! Ctrl-C or SIGTERM stops the probe server and the worker pool.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snapshot_engine::clients::{AnalysisStore, InMemoryStore, SqlGatewayClient, SqlGatewayRegistry};
use snapshot_engine::scheduler::{EngineJobHandler, InMemoryJobQueue, MaintenanceJobs, Scheduler};
use snapshot_engine::snapshots::SnapshotOrchestrator;
use snapshot_engine::telemetry::SnapshotTelemetry;

mod config;

/// State shared with the probe handlers.
#[derive(Clone)]
struct ProbeState {
    store: Arc<dyn AnalysisStore>,
    gateway: SqlGatewayClient,
    orchestrator: Arc<SnapshotOrchestrator>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!(
                "snapshot_service={lvl},snapshot_engine={lvl},tower_http={lvl}",
                lvl = default_level
            )
            .into()
        }))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        service = "snapshot-service",
        version = env!("CARGO_PKG_VERSION"),
        engine_version = snapshot_engine::VERSION,
        "Starting snapshot service"
    );

    let config = config::Config::load()?;

    // Wiring
    let telemetry = SnapshotTelemetry::new();
    let store: Arc<dyn AnalysisStore> = Arc::new(InMemoryStore::new());
    let gateway = SqlGatewayClient::new(config.gateway_config()?)?;
    let warehouses = Arc::new(SqlGatewayRegistry::new(gateway.clone()));

    let orchestrator = Arc::new(SnapshotOrchestrator::new(
        Arc::clone(&store),
        warehouses.clone(),
        telemetry.clone(),
        config.orchestrator_config(),
    ));
    let handler = EngineJobHandler::new(
        Arc::clone(&orchestrator),
        MaintenanceJobs::new(Arc::clone(&store), warehouses),
        telemetry.clone(),
    );
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(InMemoryJobQueue::new()),
        Arc::new(handler),
        telemetry,
        config.scheduler_config(),
    ));

    scheduler.register_sweeps().await?;

    let shutdown = CancellationToken::new();

    let worker = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let state = ProbeState {
        store,
        gateway,
        orchestrator,
    };
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(address = %addr, "Probe server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await;

    // The worker stops on the same token even if the server failed.
    shutdown.cancel();
    if let Err(e) = worker.await {
        error!(error = %e, "Scheduler task ended abnormally");
    }

    served?;
    info!("Snapshot service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

// =============================================================================
// Health Endpoints
// =============================================================================

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    store: bool,
    sql_gateway: bool,
    active_runs: usize,
}

/// Liveness probe - always returns OK if the process is running.
async fn health_check() -> &'static str {
    "OK"
}

/// Readiness probe - the store must answer; the gateway state is reported.
async fn readiness_check(State(state): State<ProbeState>) -> (StatusCode, Json<ReadinessResponse>) {
    let store = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Store ping failed");
            false
        }
    };
    let sql_gateway = state.gateway.health_check().await;

    let status = if store { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(ReadinessResponse {
            status: if store { "READY" } else { "NOT_READY" },
            store,
            sql_gateway,
            active_runs: state.orchestrator.active_runs(),
        }),
    )
}
