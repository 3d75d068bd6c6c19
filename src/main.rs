//! Lornu Peering Agent
//!
//! Receives Create/Update/Delete lifecycle notifications for cross-account
//! VPC peering resources and drives the provider to the declared state.
//! Runs as an HTTP service, or handles a single event from a file in
//! job mode.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lornu_peering::agents::peering::{
    Ec2NetworkClient, LifecycleEvent, LifecycleResponse, PeeringConfig, PeeringOrchestrator,
    PeeringRequest, ResponseStatus, StsCredentialBroker,
};
use lornu_peering::tools::ParameterStoreTool;

/// Peering Agent - cross-account VPC peering lifecycle handler
#[derive(Parser, Debug)]
#[command(name = "peering-agent", version, about)]
struct Args {
    /// Region hosting the local side of the peering connections
    #[arg(long, env = "AWS_REGION", default_value = "eu-west-1")]
    region: String,

    /// Listen port for the lifecycle endpoint
    #[arg(long, default_value = "8080", env = "LORNU_PEERING_PORT")]
    port: u16,

    /// Parameter-store prefix for published connection ids (disabled when unset)
    #[arg(long, env = "LORNU_PEERING_PARAMETER_PREFIX")]
    parameter_prefix: Option<String>,

    /// Handle a single lifecycle event from a JSON file and exit
    #[arg(long)]
    event_file: Option<std::path::PathBuf>,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<PeeringOrchestrator>,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .json()
        .init();

    let args = Args::parse();
    let config = PeeringConfig::from_env();

    let network = Arc::new(Ec2NetworkClient::new(config.op_timeout));
    let broker = Arc::new(StsCredentialBroker::new(&args.region)?);
    let mut orchestrator = PeeringOrchestrator::new(network, broker, config);

    if let Some(prefix) = &args.parameter_prefix {
        match ParameterStoreTool::new(&args.region, prefix).await {
            Ok(store) => {
                orchestrator = orchestrator.with_parameter_store(Arc::new(store));
            }
            Err(e) => warn!(error = %e, "parameter store publication disabled"),
        }
    }

    let orchestrator = Arc::new(orchestrator);

    if let Some(path) = &args.event_file {
        return run_once(orchestrator, path).await;
    }

    let state = AppState { orchestrator };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/peering/lifecycle", post(handle_lifecycle))
        .route("/api/peering/status", post(peering_status))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Peering agent listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Handle one event from disk and exit; non-zero on a failed invocation.
async fn run_once(orchestrator: Arc<PeeringOrchestrator>, path: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read event file {:?}", path))?;

    let event: LifecycleEvent =
        serde_json::from_str(&raw).context("Invalid lifecycle event")?;

    let response = orchestrator.handle(event).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if response.status == ResponseStatus::Failed {
        anyhow::bail!(
            "invocation failed: {}",
            response.reason.unwrap_or_else(|| "unknown reason".to_string())
        );
    }
    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lornu-peering"
    }))
}

async fn handle_lifecycle(
    State(state): State<AppState>,
    Json(event): Json<LifecycleEvent>,
) -> Json<LifecycleResponse> {
    Json(state.orchestrator.handle(event).await)
}

async fn peering_status(
    State(state): State<AppState>,
    Json(request): Json<PeeringRequest>,
) -> Json<serde_json::Value> {
    match state.orchestrator.current_state(&request).await {
        Ok(Some(connection)) => Json(serde_json::json!({
            "found": true,
            "connection": connection
        })),
        Ok(None) => Json(serde_json::json!({ "found": false })),
        Err(err) => Json(serde_json::json!({
            "found": false,
            "error": err.to_string()
        })),
    }
}
