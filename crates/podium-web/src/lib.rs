//! Axum entry points for Podium ingestion: the aggregate run, the
//! single-source run, and the run log read that dashboards consume.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use podium_ingest::{Orchestrator, RunSummary};
use podium_store::RunLogStore;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

pub mod auth;
pub mod error;

use auth::{require_ingest_access, resolve_identity, AuthConfig, EntryPoint};
use error::ApiError;

pub const CRATE_NAME: &str = "podium-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub runs: Arc<dyn RunLogStore>,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct TriggerBody {
    #[serde(default)]
    pub manual_trigger: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ingest/run", post(aggregate_run_handler))
        .route("/ingest/run/{source}", post(source_run_handler))
        .route("/runs", get(runs_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "podium web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn aggregate_run_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<TriggerBody>>,
) -> Result<Json<RunSummary>, ApiError> {
    let identity = resolve_identity(&state.auth, &headers)?;
    require_ingest_access(identity, EntryPoint::Aggregate)?;

    let manual = body.map(|Json(b)| b.manual_trigger).unwrap_or(false);
    info!(?identity, manual_trigger = manual, "aggregate ingestion run requested");

    let summary = state.orchestrator.run_all().await?;
    Ok(Json(summary))
}

async fn source_run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(source): AxumPath<String>,
    headers: HeaderMap,
    body: Option<Json<TriggerBody>>,
) -> Result<Json<RunSummary>, ApiError> {
    let identity = resolve_identity(&state.auth, &headers)?;
    require_ingest_access(identity, EntryPoint::SingleSource)?;

    let manual = body.map(|Json(b)| b.manual_trigger).unwrap_or(false);
    info!(?identity, source, manual_trigger = manual, "single-source ingestion run requested");

    let summary = state.orchestrator.run_source(&source).await?;
    Ok(Json(summary))
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<podium_core::ScrapeRun>>, ApiError> {
    let runs = state
        .runs
        .recent(50)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(runs))
}

async fn healthz_handler() -> &'static str {
    "ok"
}
